//! Compare-mode harness: every expression here runs on both execution
//! engines, the bytecode VM and the tree-walk evaluator, and must produce
//! the same printed result. Feature work that lands in only one engine fails
//! here first.

use lyra_runtime::env::Env;
use lyrac::bootstrap;

/// Curated expression set. Kept side-effect-free per entry (each engine gets
/// its own environment) and shallow enough for the tree walker's native
/// recursion.
const CASES: &[&str] = &[
    // scalars & arithmetic
    "42",
    "-3",
    "2.5",
    "(+ 1 2 3 4 5)",
    "(- 10 1 2)",
    "(* 2 3 4)",
    "(/ 12 4)",
    "(/ 1 2)",
    "(mod -7 3)",
    "(rem -7 3)",
    "(inc 41)",
    "(max 3 1 4 1 5)",
    "(< 1 2 3)",
    "(= 1 1.0)",
    "(not= :a :b)",
    // strings, chars, keywords
    "(str \"a\" 1 :k)",
    "(upper-case \"abc\")",
    "\\newline",
    "(name :ns/key)",
    "(keyword \"x\")",
    // collections
    "[1 2 3]",
    "{:a 1, :b 2}",
    "#{1}",
    "(conj [1 2] 3)",
    "(conj '(1 2) 0)",
    "(assoc {:a 1} :b 2)",
    "(dissoc {:a 1 :b 2} :a)",
    "(get {:a 1} :a)",
    "(get [10 20 30] 1)",
    "(:a {:a :found})",
    "({:k :v} :k)",
    "([:x :y] 1)",
    "(contains? {:a 1} :a)",
    "(count \"hello\")",
    "(nth [1 2 3] 2)",
    "(vec '(1 2))",
    "(keys {:a 1 :b 2})",
    "(vals {:a 1 :b 2})",
    // sequences
    "(first [1 2])",
    "(rest [1 2 3])",
    "(cons 0 [1 2])",
    "(range 5)",
    "(take 3 (range))",
    "(drop 2 (range 5))",
    "(map inc [1 2 3])",
    "(filter even? (range 10))",
    "(reduce + 0 (range 10))",
    "(reduce + (range 100))",
    "(sort [3 1 2])",
    "(sort-by count [\"ccc\" \"a\" \"bb\"])",
    "(reverse [1 2 3])",
    "(distinct [1 1 2 2 3])",
    "(interpose :and [1 2 3])",
    "(partition 2 (range 6))",
    "(into [] (map inc) [1 2 3])",
    "(apply + [1 2 3])",
    "(apply + 1 2 [3 4])",
    "(concat [1] [2 3])",
    "(second [1 2 3])",
    "(last [1 2 3])",
    // control flow
    "(if true :t :f)",
    "(if nil :t :f)",
    "(if false :t)",
    "(when (< 1 2) :yes)",
    "(when-not (< 1 2) :no)",
    "(and 1 2 3)",
    "(and 1 nil 3)",
    "(or nil false :found)",
    "(or nil nil)",
    "(cond (= 1 2) :a (= 1 1) :b)",
    "(case 2 1 :one 2 :two :other)",
    "(case :zz 1 :one 2 :two :other)",
    "(do 1 2 3)",
    "(let [a 1 b (+ a 1)] (vector a b))",
    "(loop [i 0 acc []] (if (= i 4) acc (recur (inc i) (conj acc i))))",
    // functions
    "((fn [x] (* x x)) 7)",
    "((fn f [n] (if (= n 0) 1 (* n (f (dec n))))) 6)",
    "((fn [a & more] (vector a more)) 1 2 3)",
    "((fn ([x] :one) ([x y] :two)) 9)",
    "((partial + 10) 5)",
    "((comp inc inc) 1)",
    "((constantly :k) 1 2 3)",
    "(map (fn [x] (* 2 x)) (range 4))",
    // core library (tree-loaded, recompiled)
    "(every? even? [2 4 6])",
    "(every? even? [2 3])",
    "(some odd? [2 3 4])",
    "(take-while odd? [1 3 4 5])",
    "(drop-while odd? [1 3 4 5])",
    "(zipmap [:a :b] [1 2])",
    "(merge {:a 1} {:b 2} {:a 9})",
    "(frequencies [:a :b :a])",
    "(sum (range 5))",
    // exceptions
    "(try (/ 1 0) (catch :default e :caught))",
    "(try :fine (catch :default e :caught))",
    "(try (throw (ex-info \"x\" {:v 9})) (catch :default e (ex-data e)))",
    "(try 1 (finally 2))",
    // laziness
    "(doall (map inc [1 2]))",
    "(realized? (range 3))",
    "(deref (delay :computed))",
    "(count (lazy-seq (cons 1 nil)))",
    // state
    "(let [a (atom 0)] (swap! a inc) (swap! a + 10) (deref a))",
    "(let [v (volatile! 1)] (vreset! v 2) (deref v))",
    "(let [t (transient [])] (conj! t 1) (conj! t 2) (persistent! t))",
    // printing-adjacent
    "(pr-str [1 \"s\" :k])",
    "(str {:a 1})",
];

fn print_result(env: &Env, outcome: Result<lyra_runtime::Value, lyrac::EvalError>) -> String {
    match outcome {
        Ok(v) => {
            let scope = env.roots();
            scope.keep(v);
            lyra_runtime::printer::pr_str(env, v).unwrap_or_else(|_| "#<unprintable>".into())
        }
        Err(lyrac::EvalError::Compile(e)) => format!("compile error: {}", e.message),
        Err(lyrac::EvalError::Thrown(exc)) => {
            let scope = env.roots();
            scope.keep(exc);
            let t = lyra_runtime::error::ex_type(env, exc)
                .map(|t| {
                    lyra_runtime::printer::pr_str(env, t).unwrap_or_default()
                })
                .unwrap_or_default();
            format!("thrown {t}")
        }
    }
}

#[test]
fn both_engines_agree_on_the_curated_set() {
    let vm_env = bootstrap::new_env();
    let tw_env = bootstrap::new_env();
    let _m1 = vm_env.gc.register_mutator();
    let _m2 = tw_env.gc.register_mutator();
    let mut failures = Vec::new();
    for case in CASES {
        let vm_out = print_result(&vm_env, lyrac::eval_str(&vm_env, case));
        let tw_out = print_result(&tw_env, lyrac::eval_str_treewalk(&tw_env, case));
        if vm_out != tw_out {
            failures.push(format!("{case}\n  vm:   {vm_out}\n  tree: {tw_out}"));
        }
    }
    assert!(
        failures.is_empty(),
        "engines disagree on {} case(s):\n{}",
        failures.len(),
        failures.join("\n")
    );
}

#[test]
fn both_engines_agree_on_stateful_programs() {
    // Programs with defs run in fresh environments per engine.
    const PROGRAMS: &[&str] = &[
        "(defn fact [n] (if (= n 0) 1 (* n (fact (dec n))))) (fact 10)",
        "(def base 10) (defn scaled [x] (* base x)) (scaled 5)",
        "(defprotocol Sized (size-of [this]))
         (extend-protocol Sized String (size-of [s] (count s)))
         (size-of \"four\")",
        "(defmulti speak type)
         (defmethod speak :integer [x] :number)
         (defmethod speak :default [x] :other)
         (vector (speak 1) (speak :k))",
        "(def *depth* 0) (binding [*depth* 5] *depth*)",
    ];
    for program in PROGRAMS {
        let vm_env = bootstrap::new_env();
        let tw_env = bootstrap::new_env();
        let _m1 = vm_env.gc.register_mutator();
        let _m2 = tw_env.gc.register_mutator();
        let vm_out = print_result(&vm_env, lyrac::eval_str(&vm_env, program));
        let tw_out = print_result(&tw_env, lyrac::eval_str_treewalk(&tw_env, program));
        assert_eq!(vm_out, tw_out, "engines disagree on program: {program}");
    }
}

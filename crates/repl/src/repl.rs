//! Interactive REPL over rustyline, with history persisted under the home
//! directory. Multi-line input is supported by continuing while delimiters
//! are open.

use std::process::ExitCode;

use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

pub fn run() -> ExitCode {
    let env = lyrac::bootstrap::new_env();
    let _mutator = env.gc.register_mutator();

    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("lyra: cannot start line editor: {e}");
            return ExitCode::FAILURE;
        }
    };
    let history_path = home::home_dir().map(|d| d.join(".lyra_history"));
    if let Some(path) = &history_path {
        let _ = editor.load_history(path);
    }

    println!("Lyra {} - :quit or Ctrl-D to exit", env!("CARGO_PKG_VERSION"));

    let mut pending = String::new();
    loop {
        let prompt = if pending.is_empty() { "lyra=> " } else { "  ...> " };
        match editor.readline(prompt) {
            Ok(line) => {
                if pending.is_empty() && line.trim() == ":quit" {
                    break;
                }
                pending.push_str(&line);
                pending.push('\n');
                if open_delimiters(&pending) > 0 {
                    continue;
                }
                let input = std::mem::take(&mut pending);
                if input.trim().is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(input.trim());
                match lyrac::eval_str(&env, &input) {
                    Ok(v) => crate::print_value(&env, v),
                    Err(e) => crate::report_error(&env, &e, "<repl>", &input),
                }
            }
            Err(ReadlineError::Interrupted) => {
                pending.clear();
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("lyra: readline error: {e}");
                break;
            }
        }
    }

    if let Some(path) = &history_path {
        let _ = editor.save_history(path);
    }
    ExitCode::SUCCESS
}

/// Net count of unclosed delimiters, ignoring strings and comments. Used to
/// decide whether to keep reading continuation lines.
fn open_delimiters(src: &str) -> i32 {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut in_comment = false;
    let mut escaped = false;
    for c in src.chars() {
        if in_comment {
            if c == '\n' {
                in_comment = false;
            }
            continue;
        }
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            ';' => in_comment = true,
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            _ => {}
        }
    }
    depth
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delimiter_counting() {
        assert_eq!(open_delimiters("(+ 1 2)"), 0);
        assert_eq!(open_delimiters("(let [x 1]"), 2);
        assert_eq!(open_delimiters("\"(not a paren\""), 0);
        assert_eq!(open_delimiters("; (comment\n(+ 1"), 1);
    }
}

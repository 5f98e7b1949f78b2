//! Reader: source text → forms
//!
//! Tokenizer plus a recursive reader. Commas are whitespace, `;` comments to
//! end of line, `#_` discards the next form, `'x` is `(quote x)` sugar kept
//! as a distinct form, `#"..."` is a regex literal, `#{...}` a set literal.
//! Every token records the 1-indexed line/column it started at.

use crate::CompilerError;
use crate::form::Form;
use lyra_runtime::error::Phase;
use lyra_runtime::{ErrorKind, Loc};

#[derive(Debug, Clone)]
struct Token {
    text: String,
    kind: TokenKind,
    line: u32,
    col: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Open(char),  // ( [ {
    Close(char), // ) ] }
    SetOpen,     // #{
    Quote,       // '
    Discard,     // #_
    Str,
    Regex,
    Char,
    Atom, // number, symbol, keyword, nil, true, false
}

impl Token {
    fn loc(&self) -> Loc {
        Loc::new(self.line, self.col)
    }
}

fn err(kind: ErrorKind, loc: Loc, msg: impl Into<String>) -> CompilerError {
    CompilerError::new(kind, Phase::Parse, loc, msg)
}

struct Tokenizer<'s> {
    chars: std::iter::Peekable<std::str::Chars<'s>>,
    line: u32,
    col: u32,
}

impl<'s> Tokenizer<'s> {
    fn new(src: &'s str) -> Tokenizer<'s> {
        Tokenizer { chars: src.chars().peekable(), line: 1, col: 1 }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn skip_blank(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() || c == ',' {
                self.bump();
            } else if c == ';' {
                while let Some(c) = self.bump() {
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn read_string_body(&mut self, line: u32, col: u32) -> Result<String, CompilerError> {
        let mut out = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(err(
                    ErrorKind::Syntax,
                    Loc::new(line, col),
                    "unexpected end of input in string",
                ));
            };
            match c {
                '"' => return Ok(out),
                '\\' => {
                    let esc_loc = Loc::new(self.line, self.col);
                    let Some(e) = self.bump() else {
                        return Err(err(ErrorKind::Syntax, esc_loc, "dangling escape in string"));
                    };
                    match e {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '\\' => out.push('\\'),
                        '"' => out.push('"'),
                        'u' => {
                            let mut hex = String::new();
                            for _ in 0..4 {
                                match self.bump() {
                                    Some(h) if h.is_ascii_hexdigit() => hex.push(h),
                                    _ => {
                                        return Err(err(
                                            ErrorKind::Syntax,
                                            esc_loc,
                                            "\\u requires four hex digits",
                                        ));
                                    }
                                }
                            }
                            let code = u32::from_str_radix(&hex, 16).expect("hex digits");
                            match char::from_u32(code) {
                                Some(c) => out.push(c),
                                None => {
                                    return Err(err(
                                        ErrorKind::Syntax,
                                        esc_loc,
                                        format!("\\u{hex} is not a scalar value"),
                                    ));
                                }
                            }
                        }
                        other => {
                            return Err(err(
                                ErrorKind::Syntax,
                                esc_loc,
                                format!("bad escape: \\{other}"),
                            ));
                        }
                    }
                }
                _ => out.push(c),
            }
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, CompilerError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_blank();
            let (line, col) = (self.line, self.col);
            let Some(c) = self.peek() else { break };
            match c {
                '(' | '[' | '{' => {
                    self.bump();
                    tokens.push(Token { text: c.to_string(), kind: TokenKind::Open(c), line, col });
                }
                ')' | ']' | '}' => {
                    self.bump();
                    tokens.push(Token {
                        text: c.to_string(),
                        kind: TokenKind::Close(c),
                        line,
                        col,
                    });
                }
                '\'' => {
                    self.bump();
                    tokens.push(Token { text: "'".into(), kind: TokenKind::Quote, line, col });
                }
                '"' => {
                    self.bump();
                    let body = self.read_string_body(line, col)?;
                    tokens.push(Token { text: body, kind: TokenKind::Str, line, col });
                }
                '#' => {
                    self.bump();
                    match self.peek() {
                        Some('{') => {
                            self.bump();
                            tokens.push(Token {
                                text: "#{".into(),
                                kind: TokenKind::SetOpen,
                                line,
                                col,
                            });
                        }
                        Some('_') => {
                            self.bump();
                            tokens.push(Token {
                                text: "#_".into(),
                                kind: TokenKind::Discard,
                                line,
                                col,
                            });
                        }
                        Some('"') => {
                            self.bump();
                            let body = self.read_string_body(line, col)?;
                            tokens.push(Token { text: body, kind: TokenKind::Regex, line, col });
                        }
                        Some('#') => {
                            // Symbolic values: ##Inf, ##-Inf, ##NaN.
                            self.bump();
                            let mut name = String::from("##");
                            while let Some(c) = self.peek() {
                                if c.is_whitespace() || "()[]{}\"';,".contains(c) {
                                    break;
                                }
                                name.push(c);
                                self.bump();
                            }
                            tokens.push(Token { text: name, kind: TokenKind::Atom, line, col });
                        }
                        _ => {
                            return Err(err(
                                ErrorKind::Syntax,
                                Loc::new(line, col),
                                "unsupported dispatch macro after #",
                            ));
                        }
                    }
                }
                '\\' => {
                    self.bump();
                    let mut name = String::new();
                    while let Some(c) = self.peek() {
                        if c.is_whitespace() || "()[]{}\",;".contains(c) {
                            break;
                        }
                        name.push(c);
                        self.bump();
                    }
                    if name.is_empty() {
                        return Err(err(
                            ErrorKind::Syntax,
                            Loc::new(line, col),
                            "dangling character literal",
                        ));
                    }
                    tokens.push(Token { text: name, kind: TokenKind::Char, line, col });
                }
                _ => {
                    let mut text = String::new();
                    while let Some(c) = self.peek() {
                        if c.is_whitespace() || "()[]{}\"';,".contains(c) {
                            break;
                        }
                        text.push(c);
                        self.bump();
                    }
                    tokens.push(Token { text, kind: TokenKind::Atom, line, col });
                }
            }
        }
        Ok(tokens)
    }
}

struct Reader {
    tokens: Vec<Token>,
    pos: usize,
}

impl Reader {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn read_form(&mut self) -> Result<Form, CompilerError> {
        let Some(token) = self.bump() else {
            return Err(err(ErrorKind::Syntax, Loc::new(0, 0), "unexpected end of input"));
        };
        let loc = token.loc();
        match token.kind {
            TokenKind::Open('(') => self.read_seq(')', loc).map(|items| Form::List(items, loc)),
            TokenKind::Open('[') => self.read_seq(']', loc).map(|items| Form::Vector(items, loc)),
            TokenKind::Open('{') => {
                let items = self.read_seq('}', loc)?;
                if items.len() % 2 != 0 {
                    return Err(err(
                        ErrorKind::Syntax,
                        loc,
                        "map literal requires an even number of forms",
                    ));
                }
                let mut pairs = Vec::with_capacity(items.len() / 2);
                let mut iter = items.into_iter();
                while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                    pairs.push((k, v));
                }
                Ok(Form::Map(pairs, loc))
            }
            TokenKind::SetOpen => self.read_seq('}', loc).map(|items| Form::Set(items, loc)),
            TokenKind::Open(c) => {
                Err(err(ErrorKind::Syntax, loc, format!("unexpected delimiter {c}")))
            }
            TokenKind::Close(c) => {
                Err(err(ErrorKind::Syntax, loc, format!("unmatched delimiter {c}")))
            }
            TokenKind::Quote => {
                let quoted = self.read_form()?;
                Ok(Form::Quote(Box::new(quoted), loc))
            }
            TokenKind::Discard => {
                self.read_form()?; // read and drop
                self.read_form()
            }
            TokenKind::Str => Ok(Form::Str(token.text, loc)),
            TokenKind::Regex => Ok(Form::Regex(token.text, loc)),
            TokenKind::Char => read_char(&token.text, loc),
            TokenKind::Atom => read_atom(&token.text, loc),
        }
    }

    fn read_seq(&mut self, close: char, open_loc: Loc) -> Result<Vec<Form>, CompilerError> {
        let mut items = Vec::new();
        loop {
            match self.peek() {
                None => {
                    return Err(err(
                        ErrorKind::Syntax,
                        open_loc,
                        format!("unexpected end of input, expected {close}"),
                    ));
                }
                Some(t) if t.kind == TokenKind::Close(close) => {
                    self.bump();
                    return Ok(items);
                }
                Some(t) => {
                    if let TokenKind::Close(other) = t.kind {
                        return Err(err(
                            ErrorKind::Syntax,
                            t.loc(),
                            format!("mismatched delimiter {other}, expected {close}"),
                        ));
                    }
                    items.push(self.read_form()?);
                }
            }
        }
    }
}

fn read_char(name: &str, loc: Loc) -> Result<Form, CompilerError> {
    let c = match name {
        "newline" => '\n',
        "space" => ' ',
        "tab" => '\t',
        "return" => '\r',
        _ => {
            let mut chars = name.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => c,
                _ => {
                    return Err(err(
                        ErrorKind::Syntax,
                        loc,
                        format!("unsupported character literal \\{name}"),
                    ));
                }
            }
        }
    };
    Ok(Form::Char(c, loc))
}

fn read_atom(text: &str, loc: Loc) -> Result<Form, CompilerError> {
    match text {
        "nil" => return Ok(Form::Nil(loc)),
        "true" => return Ok(Form::Bool(true, loc)),
        "false" => return Ok(Form::Bool(false, loc)),
        // Symbolic values printed for non-finite floats.
        "##Inf" => return Ok(Form::Float(f64::INFINITY, loc)),
        "##-Inf" => return Ok(Form::Float(f64::NEG_INFINITY, loc)),
        "##NaN" => return Ok(Form::Float(f64::NAN, loc)),
        _ => {}
    }
    if let Some(name) = text.strip_prefix("##") {
        return Err(err(ErrorKind::Syntax, loc, format!("unknown symbolic value ##{name}")));
    }
    if let Some(name) = text.strip_prefix(':') {
        if name.is_empty() {
            return Err(err(ErrorKind::Syntax, loc, "empty keyword"));
        }
        return Ok(Form::Keyword(name.to_string(), loc));
    }
    // Numbers: optional sign then a digit.
    let numeric = {
        let mut chars = text.chars();
        match chars.next() {
            Some('+' | '-') => chars.next().is_some_and(|c| c.is_ascii_digit()),
            Some(c) => c.is_ascii_digit(),
            None => false,
        }
    };
    if numeric {
        if text.contains('.') || text.contains('e') || text.contains('E') {
            return text
                .parse::<f64>()
                .map(|f| Form::Float(f, loc))
                .map_err(|_| err(ErrorKind::Syntax, loc, format!("bad number literal: {text}")));
        }
        return text
            .parse::<i64>()
            .map(|n| Form::Int(n, loc))
            .map_err(|_| err(ErrorKind::Syntax, loc, format!("bad number literal: {text}")));
    }
    Ok(Form::Sym(text.to_string(), loc))
}

/// Read every top-level form in `src`.
pub fn read_all(src: &str) -> Result<Vec<Form>, CompilerError> {
    let tokens = Tokenizer::new(src).tokenize()?;
    let mut reader = Reader { tokens, pos: 0 };
    let mut forms = Vec::new();
    while reader.peek().is_some() {
        forms.push(reader.read_form()?);
    }
    Ok(forms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(src: &str) -> Form {
        let forms = read_all(src).unwrap();
        assert_eq!(forms.len(), 1, "expected one form from {src}");
        forms.into_iter().next().unwrap()
    }

    #[test]
    fn atoms() {
        assert!(matches!(one("42"), Form::Int(42, _)));
        assert!(matches!(one("-7"), Form::Int(-7, _)));
        assert!(matches!(one("2.5"), Form::Float(f, _) if f == 2.5));
        assert!(matches!(one("nil"), Form::Nil(_)));
        assert!(matches!(one("true"), Form::Bool(true, _)));
        assert!(matches!(one(":k"), Form::Keyword(ref s, _) if s == "k"));
        assert!(matches!(one("foo/bar"), Form::Sym(ref s, _) if s == "foo/bar"));
        assert!(matches!(one("\\newline"), Form::Char('\n', _)));
    }

    #[test]
    fn strings_with_escapes() {
        assert!(matches!(one(r#""a\nb""#), Form::Str(ref s, _) if s == "a\nb"));
        assert!(matches!(one(r#""A""#), Form::Str(ref s, _) if s == "A"));
        assert!(read_all(r#""bad \q""#).is_err());
        assert!(read_all(r#""unterminated"#).is_err());
    }

    #[test]
    fn collections_nest() {
        let form = one("(f [1 2] {:a 1} #{3})");
        let Form::List(items, _) = form else { panic!("expected list") };
        assert_eq!(items.len(), 4);
        assert!(matches!(items[1], Form::Vector(..)));
        assert!(matches!(items[2], Form::Map(..)));
        assert!(matches!(items[3], Form::Set(..)));
    }

    #[test]
    fn commas_are_whitespace_and_comments_skipped() {
        let forms = read_all("[1, 2] ; trailing\n3").unwrap();
        assert_eq!(forms.len(), 2);
    }

    #[test]
    fn discard_drops_next_form() {
        let forms = read_all("#_(ignored 1 2) 5").unwrap();
        assert_eq!(forms.len(), 1);
        assert!(matches!(forms[0], Form::Int(5, _)));
    }

    #[test]
    fn delimiter_errors_have_locations() {
        let e = read_all("(foo\n(bar]").unwrap_err();
        assert_eq!(e.kind, ErrorKind::Syntax);
        assert_eq!(e.loc.line, 2, "error should point at the bad delimiter");
        assert!(read_all("(never closed").is_err());
        assert!(read_all("{:a}").is_err(), "odd map literal");
    }

    #[test]
    fn quote_sugar() {
        let form = one("'(1 2)");
        assert!(matches!(form, Form::Quote(..)));
    }

    #[test]
    fn symbolic_float_values() {
        assert!(matches!(one("##Inf"), Form::Float(f, _) if f == f64::INFINITY));
        assert!(matches!(one("##-Inf"), Form::Float(f, _) if f == f64::NEG_INFINITY));
        assert!(matches!(one("##NaN"), Form::Float(f, _) if f.is_nan()));
        assert!(read_all("##Whatever").is_err());
        // Delimiters terminate the token inside collections.
        let Form::Vector(items, _) = one("[##Inf 1]") else { panic!("expected vector") };
        assert_eq!(items.len(), 2);
    }
}

//! Command line tokenizer for `exec`
//!
//! POSIX-shell-like word splitting and quoting, and nothing more:
//! 1. Whitespace separates words
//! 2. Single quotes are fully literal
//! 3. Double quotes keep spaces; backslash escapes `"`, `\`, `$`, `` ` `` and newline
//! 4. Outside quotes a backslash escapes the next character
//! 5. `#` at the start of a word comments out the rest of the line
//!
//! No globbing, no variable expansion. Unquoted control operators are
//! refused instead of being passed through as arguments.

use std::iter::Peekable;
use std::str::Chars;

/// A single command (program + arguments)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleCommand {
    /// Program name
    pub program: String,
    /// Arguments (not including program name)
    pub args: Vec<String>,
}

impl SimpleCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Parse error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Nothing to run
    EmptyCommand,
    /// Unterminated quoted string
    UnterminatedQuote(char),
    /// Backslash at the very end of input
    TrailingEscape,
    /// Pipes, redirections, lists and subshells are not emulated
    UnsupportedOperator(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyCommand => write!(f, "empty command"),
            Self::UnterminatedQuote(c) => write!(f, "unterminated {} quote", c),
            Self::TrailingEscape => write!(f, "trailing backslash"),
            Self::UnsupportedOperator(op) => write!(f, "unsupported shell operator: {}", op),
        }
    }
}

impl std::error::Error for ParseError {}

const OPERATOR_CHARS: &[char] = &['|', '&', ';', '<', '>', '(', ')'];

/// Tokenizer for shell input
struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(&c) = self.chars.peek() {
            if c.is_whitespace() {
                self.chars.next();
            } else {
                break;
            }
        }
    }

    fn next_word(&mut self) -> Result<Option<String>, ParseError> {
        self.skip_whitespace();

        match self.chars.peek() {
            None => return Ok(None),
            Some('#') => {
                // Comment runs to end of line; a following line may still hold words
                for c in self.chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
                return self.next_word();
            }
            Some(&c) if OPERATOR_CHARS.contains(&c) => return Err(self.read_operator()),
            Some(_) => {}
        }

        let mut word = String::new();
        // Distinguishes '' (an empty argument) from no word at all
        let mut quoted = false;

        while let Some(&c) = self.chars.peek() {
            match c {
                c if c.is_whitespace() => break,
                c if OPERATOR_CHARS.contains(&c) => return Err(self.read_operator()),
                '\'' => {
                    self.chars.next();
                    quoted = true;
                    word.push_str(&self.read_single_quoted()?);
                }
                '"' => {
                    self.chars.next();
                    quoted = true;
                    word.push_str(&self.read_double_quoted()?);
                }
                '\\' => {
                    self.chars.next();
                    match self.chars.next() {
                        // Line continuation
                        Some('\n') => {}
                        Some(escaped) => word.push(escaped),
                        None => return Err(ParseError::TrailingEscape),
                    }
                }
                _ => {
                    word.push(c);
                    self.chars.next();
                }
            }
        }

        if word.is_empty() && !quoted {
            self.next_word()
        } else {
            Ok(Some(word))
        }
    }

    fn read_operator(&mut self) -> ParseError {
        let mut op = String::new();
        while let Some(&c) = self.chars.peek() {
            if OPERATOR_CHARS.contains(&c) {
                op.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        ParseError::UnsupportedOperator(op)
    }

    fn read_single_quoted(&mut self) -> Result<String, ParseError> {
        let mut content = String::new();
        loop {
            match self.chars.next() {
                Some('\'') => return Ok(content),
                Some(c) => content.push(c),
                None => return Err(ParseError::UnterminatedQuote('\'')),
            }
        }
    }

    fn read_double_quoted(&mut self) -> Result<String, ParseError> {
        let mut content = String::new();
        loop {
            match self.chars.next() {
                Some('"') => return Ok(content),
                Some('\\') => match self.chars.next() {
                    Some('\n') => {}
                    Some(c @ ('"' | '\\' | '$' | '`')) => content.push(c),
                    Some(other) => {
                        content.push('\\');
                        content.push(other);
                    }
                    None => return Err(ParseError::UnterminatedQuote('"')),
                },
                Some(c) => content.push(c),
                None => return Err(ParseError::UnterminatedQuote('"')),
            }
        }
    }
}

/// Split a command line into words
pub fn split(input: &str) -> Result<Vec<String>, ParseError> {
    let mut lexer = Lexer::new(input);
    let mut words = Vec::new();
    while let Some(word) = lexer.next_word()? {
        words.push(word);
    }
    Ok(words)
}

/// Parse a command line into a program and its arguments
pub fn parse(input: &str) -> Result<SimpleCommand, ParseError> {
    let mut words = split(input)?;
    if words.is_empty() {
        return Err(ParseError::EmptyCommand);
    }
    let program = words.remove(0);
    Ok(SimpleCommand {
        program,
        args: words,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_command() {
        let result = parse("ls").unwrap();
        assert_eq!(result.program, "ls");
        assert!(result.args.is_empty());
    }

    #[test]
    fn test_command_with_args() {
        let result = parse("ls -la /home").unwrap();
        assert_eq!(result, SimpleCommand::new("ls").arg("-la").arg("/home"));
    }

    #[test]
    fn test_extra_whitespace() {
        let result = parse("  ls \t  -la   /home  \n").unwrap();
        assert_eq!(result.program, "ls");
        assert_eq!(result.args, vec!["-la", "/home"]);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(parse(""), Err(ParseError::EmptyCommand));
        assert_eq!(parse("   "), Err(ParseError::EmptyCommand));
        assert_eq!(parse("# just a comment"), Err(ParseError::EmptyCommand));
    }

    #[test]
    fn test_double_quoted_string() {
        let result = parse(r#"echo "hello world""#).unwrap();
        assert_eq!(result.args, vec!["hello world"]);
    }

    #[test]
    fn test_single_quotes_are_literal() {
        let result = parse(r#"echo 'a \n "b" $HOME'"#).unwrap();
        assert_eq!(result.args, vec![r#"a \n "b" $HOME"#]);
    }

    #[test]
    fn test_double_quote_escapes() {
        let result = parse(r#"echo "say \"hi\" \$x \\ \q""#).unwrap();
        assert_eq!(result.args, vec![r#"say "hi" $x \ \q"#]);
    }

    #[test]
    fn test_backslash_outside_quotes() {
        let result = parse(r"touch my\ file a\|b").unwrap();
        assert_eq!(result.args, vec!["my file", "a|b"]);
    }

    #[test]
    fn test_line_continuation() {
        let result = parse("echo one \\\ntwo").unwrap();
        assert_eq!(result.args, vec!["one", "two"]);
    }

    #[test]
    fn test_concatenated_quotes() {
        let result = parse(r#"echo foo"bar"'baz'"#).unwrap();
        assert_eq!(result.args, vec!["foobarbaz"]);
    }

    #[test]
    fn test_empty_quoted_argument_kept() {
        let result = parse(r#"printf '' """#).unwrap();
        assert_eq!(result.args, vec!["", ""]);
    }

    #[test]
    fn test_no_expansion_or_globbing() {
        let result = parse("echo $HOME *.txt ~").unwrap();
        assert_eq!(result.args, vec!["$HOME", "*.txt", "~"]);
    }

    #[test]
    fn test_operators_inside_quotes_are_text() {
        let result = parse(r#"grep "a|b" 'x > y'"#).unwrap();
        assert_eq!(result.args, vec!["a|b", "x > y"]);
    }

    #[test]
    fn test_unquoted_operators_rejected() {
        assert_eq!(
            parse("ls | grep foo"),
            Err(ParseError::UnsupportedOperator("|".to_string()))
        );
        assert_eq!(
            parse("echo hi>out.txt"),
            Err(ParseError::UnsupportedOperator(">".to_string()))
        );
        assert_eq!(
            parse("true && false"),
            Err(ParseError::UnsupportedOperator("&&".to_string()))
        );
    }

    #[test]
    fn test_comment_after_words() {
        let result = parse("echo a # trailing words").unwrap();
        assert_eq!(result.args, vec!["a"]);
    }

    #[test]
    fn test_hash_inside_word() {
        let result = parse("echo a#b").unwrap();
        assert_eq!(result.args, vec!["a#b"]);
    }

    #[test]
    fn test_unterminated_quotes() {
        assert_eq!(parse(r#"echo "hello"#), Err(ParseError::UnterminatedQuote('"')));
        assert_eq!(parse("echo 'hello"), Err(ParseError::UnterminatedQuote('\'')));
    }

    #[test]
    fn test_trailing_escape() {
        assert_eq!(parse("echo \\"), Err(ParseError::TrailingEscape));
    }
}

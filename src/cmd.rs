use std::collections::HashMap;
use std::error::Error;
use std::fmt;

#[derive(Clone, Debug)]
/// Represents all possible commands in the program's REPL
pub enum Cmd {
    /// No-op (blank input)
    Noop,
    /// Ask a question or make a request
    Ask(AskCmd),
    /// Compose content with a specific tone/format/length
    Compose(ComposeCmd),
    /// Explain the code in the current notebook
    Explain(ExplainCmd),
    /// Explain the most recent error in the current notebook
    ExplainError(ExplainErrorCmd),
    /// Generate a README.md from the current notebook
    Readme(ReadmeCmd),
    /// Anything that didn't match a known verb
    Unrecognized(String),
}

//
// Structs for all named REPL commands
//

#[derive(Clone, Debug)]
pub struct AskCmd {
    /// The prompt to message the assistant
    pub prompt: String,
    pub options: CmdOptions,
}

#[derive(Clone, Debug)]
pub struct ComposeCmd {
    /// Description of the content to compose
    pub prompt: String,
    pub options: CmdOptions,
}

#[derive(Clone, Debug)]
pub struct ExplainCmd {
    pub options: CmdOptions,
}

#[derive(Clone, Debug)]
pub struct ExplainErrorCmd {
    pub options: CmdOptions,
}

#[derive(Clone, Debug)]
pub struct ReadmeCmd {
    pub options: CmdOptions,
}

/// Option values are passed through to the client verbatim except that
/// `true`/`false` (any casing) coerce to booleans.
#[derive(Clone, Debug, PartialEq)]
pub enum OptionValue {
    Bool(bool),
    Str(String),
}

impl OptionValue {
    pub fn as_bool(&self) -> bool {
        match self {
            OptionValue::Bool(b) => *b,
            OptionValue::Str(_) => false,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(b) => write!(f, "{}", b),
            OptionValue::Str(s) => write!(f, "{}", s),
        }
    }
}

pub type CmdOptions = HashMap<String, OptionValue>;

#[derive(Debug)]
pub enum ParseError {
    /// A `--`-prefixed token without a `=` separator
    MalformedOption(String),
    /// Unbalanced quoting or a dangling escape in the input line
    Lex,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::MalformedOption(token) => {
                write!(f, "malformed option `{}`: expected --key=value", token)
            }
            ParseError::Lex => write!(f, "unbalanced quoting in input"),
        }
    }
}

impl Error for ParseError {}

/// Parses one top-level invocation.
///
/// `header` is tokenized shell-style: the first token is the verb, `--k=v`
/// tokens become options, and every other token joins the argument text in
/// encounter order. A cell body, when present, is appended to the argument
/// text as one trailing segment with its newlines preserved.
///
/// Pure function: no side effects, deterministic given identical input.
pub fn parse_user_input(header: &str, cell_body: Option<&str>) -> Result<Cmd, ParseError> {
    let body = cell_body.filter(|b| !b.trim().is_empty());
    if header.trim().is_empty() && body.is_none() {
        return Ok(Cmd::Noop);
    }
    let tokens = shlex::split(header).ok_or(ParseError::Lex)?;
    let verb = tokens.first().cloned().unwrap_or_default();

    let mut options: CmdOptions = HashMap::new();
    let mut args: Vec<&str> = vec![];
    for token in tokens.iter().skip(1) {
        if let Some(option_token) = token.strip_prefix("--") {
            let (key, value) = option_token
                .split_once('=')
                .ok_or_else(|| ParseError::MalformedOption(token.clone()))?;
            options.insert(key.to_string(), coerce_option_value(value));
        } else {
            args.push(token);
        }
    }

    let mut argument_text = args.join(" ");
    if let Some(body) = body {
        if !argument_text.is_empty() {
            argument_text.push(' ');
        }
        argument_text.push_str(body);
    }

    Ok(match verb.as_str() {
        "ask" => Cmd::Ask(AskCmd {
            prompt: argument_text,
            options,
        }),
        "compose" => Cmd::Compose(ComposeCmd {
            prompt: argument_text,
            options,
        }),
        "explain" => Cmd::Explain(ExplainCmd { options }),
        "error" => Cmd::ExplainError(ExplainErrorCmd { options }),
        "readme" => Cmd::Readme(ReadmeCmd { options }),
        _ => Cmd::Unrecognized(verb),
    })
}

fn coerce_option_value(value: &str) -> OptionValue {
    if value.eq_ignore_ascii_case("true") {
        OptionValue::Bool(true)
    } else if value.eq_ignore_ascii_case("false") {
        OptionValue::Bool(false)
    } else {
        OptionValue::Str(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ask_with_quoted_prompt_and_option() {
        let cmd = parse_user_input(r#"ask "What is Python?" --citations=true"#, None).unwrap();
        match cmd {
            Cmd::Ask(AskCmd { prompt, options }) => {
                assert_eq!(prompt, "What is Python?");
                assert_eq!(options.get("citations"), Some(&OptionValue::Bool(true)));
            }
            _ => panic!("Failed to parse ask command"),
        }
    }

    #[test]
    fn test_option_coercion() {
        let cmd = parse_user_input(
            "compose a limerick --tone=funny --raw=FALSE --suggestions=True",
            None,
        )
        .unwrap();
        match cmd {
            Cmd::Compose(ComposeCmd { prompt, options }) => {
                assert_eq!(prompt, "a limerick");
                assert_eq!(
                    options.get("tone"),
                    Some(&OptionValue::Str("funny".to_string()))
                );
                assert_eq!(options.get("raw"), Some(&OptionValue::Bool(false)));
                assert_eq!(options.get("suggestions"), Some(&OptionValue::Bool(true)));
            }
            _ => panic!("Failed to parse compose command"),
        }
    }

    #[test]
    fn test_unquoted_args_join_in_order() {
        let cmd = parse_user_input("ask what is the airspeed of an unladen swallow", None).unwrap();
        match cmd {
            Cmd::Ask(AskCmd { prompt, .. }) => {
                assert_eq!(prompt, "what is the airspeed of an unladen swallow");
            }
            _ => panic!("Failed to parse ask command"),
        }
    }

    #[test]
    fn test_args_interleaved_with_options() {
        let cmd = parse_user_input("ask summarize --citations=true this page", None).unwrap();
        match cmd {
            Cmd::Ask(AskCmd { prompt, options }) => {
                assert_eq!(prompt, "summarize this page");
                assert_eq!(options.len(), 1);
            }
            _ => panic!("Failed to parse ask command"),
        }
    }

    #[test]
    fn test_malformed_option() {
        let res = parse_user_input("ask hello --citations", None);
        match res {
            Err(ParseError::MalformedOption(token)) => assert_eq!(token, "--citations"),
            _ => panic!("Expected a malformed-option error"),
        }
    }

    #[test]
    fn test_unbalanced_quote() {
        let res = parse_user_input(r#"ask "unterminated"#, None);
        assert!(matches!(res, Err(ParseError::Lex)));
    }

    #[test]
    fn test_cell_body_appended_verbatim() {
        let cmd = parse_user_input(
            "ask --citations=false",
            Some("line one\nline two\n  indented"),
        )
        .unwrap();
        match cmd {
            Cmd::Ask(AskCmd { prompt, .. }) => {
                assert_eq!(prompt, "line one\nline two\n  indented");
            }
            _ => panic!("Failed to parse cell-mode ask"),
        }
    }

    #[test]
    fn test_cell_body_follows_header_args() {
        let cmd = parse_user_input("compose an email", Some("about the launch\ndate")).unwrap();
        match cmd {
            Cmd::Compose(ComposeCmd { prompt, .. }) => {
                assert_eq!(prompt, "an email about the launch\ndate");
            }
            _ => panic!("Failed to parse cell-mode compose"),
        }
    }

    #[test]
    fn test_blank_input_is_noop() {
        assert!(matches!(parse_user_input("   ", None), Ok(Cmd::Noop)));
        assert!(matches!(parse_user_input("", Some("  \n ")), Ok(Cmd::Noop)));
    }

    #[test]
    fn test_unrecognized_verb() {
        let cmd = parse_user_input("frobnicate the widget", None).unwrap();
        match cmd {
            Cmd::Unrecognized(verb) => assert_eq!(verb, "frobnicate"),
            _ => panic!("Expected unrecognized command"),
        }
    }

    #[test]
    fn test_option_value_kept_as_string() {
        let cmd = parse_user_input("ask x --attachment=https://a/b.png", None).unwrap();
        match cmd {
            Cmd::Ask(AskCmd { options, .. }) => {
                assert_eq!(
                    options.get("attachment"),
                    Some(&OptionValue::Str("https://a/b.png".to_string()))
                );
            }
            _ => panic!("Failed to parse ask command"),
        }
    }
}

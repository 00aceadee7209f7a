use colored::*;
use std::error::Error;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::client::{ClientError, ResponseStream};
use crate::cmd::{self, Cmd};
use crate::notebook;
use crate::session::SessionManager;
use crate::term;

const README_PATH: &str = "README.md";
const RESPONSE_START_MARKER: &str = "<sydney_response>";
const RESPONSE_END_MARKER: &str = "</sydney_response>";

/// Runs one top-level invocation: help short-circuit, parse, dispatch, and
/// unconditional session teardown.
///
/// Every failure surfaces as exactly one printed diagnostic line and the
/// invocation completes normally, with two exceptions that propagate to the
/// caller: a parse error aborts before any session is opened, and a second
/// consecutive conversation-limit fault bubbles up unhandled.
pub async fn run_invocation(
    session: &mut SessionManager,
    notebook_override: &Option<String>,
    header: &str,
    cell_body: Option<&str>,
) -> Result<(), Box<dyn Error>> {
    if is_help(header, cell_body) {
        println!("{}", HELP_MSG);
        return Ok(());
    }
    let cmd = match cmd::parse_user_input(header, cell_body) {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            return Ok(());
        }
    };
    let result = dispatch(session, notebook_override, &cmd).await;
    // Teardown runs on every path out of the dispatch, including the
    // propagating double-limit fault.
    if let Err(e) = session.close().await {
        classify_and_report(&e);
    }
    result
}

fn is_help(header: &str, cell_body: Option<&str>) -> bool {
    header.trim() == "help" || cell_body.map(|body| body.trim() == "help").unwrap_or(false)
}

async fn dispatch(
    session: &mut SessionManager,
    notebook_override: &Option<String>,
    cmd: &Cmd,
) -> Result<(), Box<dyn Error>> {
    match cmd {
        Cmd::Noop => return Ok(()),
        Cmd::Unrecognized(_) => {
            println!("Command not recognized. Use 'help' for more information.");
            return Ok(());
        }
        _ => {}
    }
    match run_handler(session, notebook_override, cmd).await {
        Ok(()) => Ok(()),
        Err(e) if is_conversation_limit(e.as_ref()) => {
            println!(
                "{}",
                "Warning: Reached conversation limit. Resetting conversation and continuing."
                    .yellow()
            );
            if let Err(reset_err) = session.reset().await {
                classify_and_report(&reset_err);
                return Ok(());
            }
            // Exactly one retry, with arguments identical to the first
            // attempt. A second consecutive limit fault propagates.
            match run_handler(session, notebook_override, cmd).await {
                Ok(()) => Ok(()),
                Err(e) if is_conversation_limit(e.as_ref()) => Err(e),
                Err(e) => {
                    classify_and_report(e.as_ref());
                    Ok(())
                }
            }
        }
        Err(e) => {
            classify_and_report(e.as_ref());
            Ok(())
        }
    }
}

fn is_conversation_limit(e: &(dyn Error + 'static)) -> bool {
    matches!(
        e.downcast_ref::<ClientError>(),
        Some(ClientError::ConversationLimit)
    )
}

async fn run_handler(
    session: &mut SessionManager,
    notebook_override: &Option<String>,
    cmd: &Cmd,
) -> Result<(), Box<dyn Error>> {
    match cmd {
        Cmd::Ask(ask) => {
            let client = session.ensure_open().await?;
            let stream = client.ask_stream(&ask.prompt, &ask.options).await?;
            stream_and_print(stream).await
        }
        Cmd::Compose(compose) => {
            let client = session.ensure_open().await?;
            let stream = client
                .compose_stream(&compose.prompt, &compose.options)
                .await?;
            stream_and_print(stream).await
        }
        Cmd::Explain(explain) => {
            let path = notebook::find_notebook(notebook_override)?;
            let code = notebook::extract_code(&path)?;
            let prompt = build_explain_prompt(&code);
            let client = session.ensure_open().await?;
            let stream = client.ask_stream(&prompt, &explain.options).await?;
            stream_and_print(stream).await
        }
        Cmd::ExplainError(explain_error) => {
            let path = notebook::find_notebook(notebook_override)?;
            let Some(error_text) = notebook::last_error(&path)? else {
                println!("There is no error to explain.");
                return Ok(());
            };
            let code = notebook::extract_code(&path)?;
            let prompt = build_error_prompt(&code, &error_text);
            let client = session.ensure_open().await?;
            let stream = client.ask_stream(&prompt, &explain_error.options).await?;
            stream_and_print(stream).await
        }
        Cmd::Readme(readme) => {
            let path = notebook::find_notebook(notebook_override)?;
            let code = notebook::extract_code(&path)?;
            let prompt = build_readme_prompt(&code);
            let client = session.ensure_open().await?;
            let stream = client.ask_stream(&prompt, &readme.options).await?;
            let answer = stream_collect_and_print(stream).await?;
            let content = extract_marked_response(&answer);
            if Path::new(README_PATH).exists() {
                let overwrite = term::ask_question(&format!(
                    "{} already exists. Overwrite? [y/N]",
                    README_PATH
                ))
                .map(|answer| answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes"))
                .unwrap_or(false);
                if !overwrite {
                    println!("Skipped writing {}.", README_PATH);
                    return Ok(());
                }
            }
            fs::write(README_PATH, content)?;
            println!("Wrote {}.", README_PATH);
            Ok(())
        }
        // Resolved in dispatch before any session work
        Cmd::Noop | Cmd::Unrecognized(_) => Ok(()),
    }
}

/// Prints fragments unbuffered, in arrival order.
async fn stream_and_print(mut stream: ResponseStream) -> Result<(), Box<dyn Error>> {
    while let Some(fragment) = stream.next().await {
        print!("{}", fragment?);
        std::io::stdout().flush()?;
    }
    // Final newline post-response-stream
    println!();
    Ok(())
}

/// Same printing discipline, but also accumulates the full answer for
/// handlers that post-process it.
async fn stream_collect_and_print(mut stream: ResponseStream) -> Result<String, Box<dyn Error>> {
    let mut answer = String::new();
    while let Some(fragment) = stream.next().await {
        let fragment = fragment?;
        print!("{}", fragment);
        std::io::stdout().flush()?;
        answer.push_str(&fragment);
    }
    println!();
    Ok(answer)
}

/// The substring between the sentinel markers; the whole answer when the
/// markers are absent.
fn extract_marked_response(answer: &str) -> &str {
    if let Some(start) = answer.find(RESPONSE_START_MARKER) {
        let tail = &answer[start + RESPONSE_START_MARKER.len()..];
        if let Some(end) = tail.find(RESPONSE_END_MARKER) {
            return &tail[..end];
        }
    }
    answer
}

fn build_explain_prompt(code: &str) -> String {
    format!(
        "Explain the following notebook code step by step:\n\n```python\n{}\n```",
        code
    )
}

fn build_error_prompt(code: &str, error: &str) -> String {
    format!(
        "The following notebook code:\n\n```python\n{}\n```\n\nfailed with this error:\n\n\
         ```\n{}\n```\n\nExplain what went wrong and how to fix it.",
        code, error
    )
}

fn build_readme_prompt(code: &str) -> String {
    format!(
        "Generate a README.md in Markdown for the notebook code below. Wrap the entire \
         README between {} and {} markers.\n\n```python\n{}\n```",
        RESPONSE_START_MARKER, RESPONSE_END_MARKER, code
    )
}

/// Maps a fault to exactly one printed line; never raises.
pub fn classify_and_report(e: &(dyn Error + 'static)) {
    match e.downcast_ref::<ClientError>() {
        Some(ClientError::NoConnection) => {
            println!(
                "Error: No connection to Copilot. Please check your internet connection and try again."
            );
        }
        Some(ClientError::ConnectionTimeout) => {
            println!("Error: Connection to Copilot timed out. Please try again later.");
        }
        Some(ClientError::NoResponse) => {
            println!(
                "Error: No response was returned from Copilot. Check your query or try again later."
            );
        }
        Some(ClientError::Throttled) => {
            println!(
                "Error: Request is throttled. Too many requests have been made in a short period. Wait and try again later."
            );
        }
        Some(ClientError::CaptchaChallenge) => {
            println!(
                "Error: Captcha challenge must be solved. Please solve the CAPTCHA and use a new cookie."
            );
        }
        Some(ClientError::CreateConversation) => {
            println!(
                "Error: Failed to create conversation. Retry or check if Copilot service is available."
            );
        }
        Some(ClientError::GetConversations) => {
            println!("Error: Failed to retrieve conversations. Please try again.");
        }
        _ => {
            println!("An unexpected error occurred: {}", e);
        }
    }
}

pub const HELP_MSG: &str = r##"Available Commands:

help                 - Show this help menu (CTRL+D quits the REPL)

ask [prompt]         - Ask a question or make a request
                       Options:
                         --attachment=[image url]
                         --context=[web page source]
                         --citations=[true|false]
                         --suggestions=[true|false]
                         --raw=[true|false]: print raw JSON records

compose [prompt]     - Compose content with a specific format and tone
                       Options:
                         --tone=[professional|casual|enthusiastic|informational|funny]
                         --format=[paragraph|email|blogpost|ideas]
                         --length=[short|medium|long]
                         --suggestions=[true|false]
                         --raw=[true|false]

explain              - Explain the code in the current notebook
error                - Explain the most recent error in the current notebook
readme               - Generate a README.md from the current notebook

A multi-line submission (alt+enter inserts a newline) is treated as a header
line plus a free-text body appended to the prompt.

Example:
  ask "What is Python?" --citations=true"##;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientSpec;
    use crate::void::VoidCounters;

    fn void_session(scenario: &str) -> (SessionManager, VoidCounters) {
        let counters = VoidCounters::new();
        let session = SessionManager::new(
            ClientSpec::Void {
                scenario: scenario.to_string(),
                counters: counters.clone(),
            },
            false,
        );
        (session, counters)
    }

    #[tokio::test]
    async fn test_ask_opens_and_closes_exactly_once() {
        let (mut session, counters) = void_session("hello-world");
        run_invocation(&mut session, &None, "ask hi", None)
            .await
            .unwrap();
        assert_eq!(counters.opened(), 1);
        assert_eq!(counters.asks(), 1);
        assert_eq!(counters.closed(), 1);
    }

    #[tokio::test]
    async fn test_unrecognized_never_opens_a_session() {
        let (mut session, counters) = void_session("hello-world");
        run_invocation(&mut session, &None, "frobnicate", None)
            .await
            .unwrap();
        assert_eq!(counters.opened(), 0);
        assert_eq!(counters.closed(), 0);
    }

    #[tokio::test]
    async fn test_help_performs_zero_session_operations() {
        let (mut session, counters) = void_session("hello-world");
        run_invocation(&mut session, &None, "help", None)
            .await
            .unwrap();
        run_invocation(&mut session, &None, "anything", Some("help"))
            .await
            .unwrap();
        assert_eq!(counters.opened(), 0);
        assert_eq!(counters.closed(), 0);
    }

    #[tokio::test]
    async fn test_parse_error_aborts_before_any_session() {
        let (mut session, counters) = void_session("hello-world");
        run_invocation(&mut session, &None, "ask hi --citations", None)
            .await
            .unwrap();
        assert_eq!(counters.opened(), 0);
    }

    #[tokio::test]
    async fn test_conversation_limit_resets_and_retries_once() {
        let (mut session, counters) = void_session("limit-once");
        run_invocation(&mut session, &None, "ask hi", None)
            .await
            .unwrap();
        assert_eq!(counters.resets(), 1);
        assert_eq!(counters.asks(), 2);
        assert_eq!(counters.closed(), 1);
    }

    #[tokio::test]
    async fn test_double_conversation_limit_propagates() {
        let (mut session, counters) = void_session("limit-always");
        let result = run_invocation(&mut session, &None, "ask hi", None).await;
        assert!(result.is_err());
        assert!(is_conversation_limit(result.unwrap_err().as_ref()));
        // One reset, two attempts, and the session still tore down
        assert_eq!(counters.resets(), 1);
        assert_eq!(counters.asks(), 2);
        assert_eq!(counters.closed(), 1);
    }

    #[tokio::test]
    async fn test_classified_fault_is_swallowed_and_session_closes() {
        let (mut session, counters) = void_session("throttled");
        run_invocation(&mut session, &None, "ask hi", None)
            .await
            .unwrap();
        assert_eq!(counters.closed(), 1);
    }

    #[tokio::test]
    async fn test_failed_open_is_classified_and_nothing_to_close() {
        let (mut session, counters) = void_session("create-conversation");
        run_invocation(&mut session, &None, "ask hi", None)
            .await
            .unwrap();
        assert_eq!(counters.opened(), 1);
        assert_eq!(counters.closed(), 0);
    }

    #[tokio::test]
    async fn test_compose_uses_compose_stream() {
        let (mut session, counters) = void_session("hello-world");
        run_invocation(&mut session, &None, "compose a story", None)
            .await
            .unwrap();
        assert_eq!(counters.composes(), 1);
        assert_eq!(counters.asks(), 0);
    }

    #[tokio::test]
    async fn test_error_with_clean_notebook_makes_zero_stream_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nb.ipynb");
        std::fs::write(
            &path,
            r#"{"cells": [{"cell_type": "code", "source": "x = 1", "outputs": []}]}"#,
        )
        .unwrap();
        let (mut session, counters) = void_session("hello-world");
        run_invocation(
            &mut session,
            &Some(path.to_str().unwrap().to_string()),
            "error",
            None,
        )
        .await
        .unwrap();
        assert_eq!(counters.asks(), 0);
        assert_eq!(counters.opened(), 0);
    }

    #[test]
    fn test_extract_marked_response() {
        assert_eq!(
            extract_marked_response(
                "noise<sydney_response>## Title\nbody</sydney_response>trailer"
            ),
            "## Title\nbody"
        );
    }

    #[test]
    fn test_extract_falls_back_to_whole_answer() {
        assert_eq!(extract_marked_response("no markers here"), "no markers here");
        assert_eq!(
            extract_marked_response("<sydney_response>unterminated"),
            "<sydney_response>unterminated"
        );
    }
}

use clap::{Parser, Subcommand};
use reedline::{self, Signal};
use std::error::Error;
use std::process;

mod client;
mod cmd;
mod cmd_processor;
mod config;
mod copilot;
mod line_editor;
mod notebook;
mod session;
mod term;
mod void;

use client::ClientSpec;
use line_editor::LineEditor;
use session::SessionManager;

/// A CLI with a REPL for chatting with Microsoft Copilot (Sydney)
#[derive(Parser)]
#[command(name = "sydney")]
#[command(
    about = "A CLI with a REPL for chatting with Microsoft Copilot (Sydney)",
    version
)]
struct Cli {
    /// Debug mode (logs protocol records to ~/.sydney/debug.log)
    #[arg(short = 'd', long = "debug")]
    debug: bool, // Defaults to false

    /// Notebook used by explain/error/readme (defaults to the most recently
    /// modified .ipynb in the current directory)
    #[arg(short = 'n', long = "notebook", value_name = "FILE")]
    notebook: Option<String>,

    /// Non-default path to config file (defaults to ~/.sydney/sydney.toml)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<String>,

    /// Subcommands for the CLI
    #[command(subcommand)]
    subcommand: Option<CliSubcommand>,
}

#[derive(Subcommand)]
enum CliSubcommand {
    /// Save the Copilot web-session cookies to the config file
    SetCookie {
        /// The full Cookie header value from a logged-in Copilot tab
        cookie: String,
    },
    /// Run a set of commands and quit.
    /// WARNING: Quote each command with single-quotes to avoid shell expansion.
    Bye {
        /// Commands to run
        commands: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Cli::parse();

    let config_path_override = args.config;
    if config_path_override.is_none() {
        config::create_config_dir_if_missing().expect("Could not create dir");
    }

    if let Some(CliSubcommand::SetCookie { cookie }) = args.subcommand {
        config::insert_config_kv(&config_path_override, &"cookies".to_string(), &cookie);
        println!("Cookies saved.");
        process::exit(0);
    }

    let cfg = match config::get_config(&config_path_override) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error: failed to read config: {}", e);
            process::exit(1);
        }
    };

    let spec = if let Ok(scenario) = std::env::var("SYDNEY_VOID") {
        // Test-only provider; no credential required
        let scenario = if scenario == "1" || scenario == "true" {
            "hello-world".to_string()
        } else {
            scenario
        };
        ClientSpec::Void {
            scenario,
            counters: void::VoidCounters::new(),
        }
    } else {
        match config::get_cookies(&cfg) {
            Some(cookies) => ClientSpec::Copilot { cookies },
            None => {
                eprintln!("{}", config::COOKIE_SETUP_MSG);
                process::exit(1);
            }
        }
    };
    let mut session = SessionManager::new(spec, args.debug);

    if let Some(CliSubcommand::Bye { commands }) = args.subcommand {
        for command in commands {
            let (header, body) = split_header_body(&command);
            cmd_processor::run_invocation(&mut session, &args.notebook, header, body).await?;
        }
        return Ok(());
    }

    repl(&mut session, &args.notebook).await
}

/// A multi-line submission is a cell-mode invocation: the first line is the
/// command header, the rest is a free-text body.
fn split_header_body(input: &str) -> (&str, Option<&str>) {
    match input.split_once('\n') {
        Some((header, body)) => (header, Some(body)),
        None => (input, None),
    }
}

async fn repl(
    session: &mut SessionManager,
    notebook_override: &Option<String>,
) -> Result<(), Box<dyn Error>> {
    let mut line_editor = LineEditor::new();
    let mut editor_prompt = line_editor::EditorPrompt::new();
    let mut index = 0u32;
    loop {
        editor_prompt.set_index(index);
        let sig = line_editor.reedline.read_line(&editor_prompt);
        let user_input = match sig {
            Ok(Signal::Success(buffer)) => buffer,
            Ok(Signal::CtrlC) => {
                continue;
            }
            Ok(Signal::CtrlD) => {
                println!("Bye!");
                break;
            }
            unk => {
                println!("Event: {:?}", unk);
                continue;
            }
        };
        let (header, body) = split_header_body(&user_input);
        cmd_processor::run_invocation(session, notebook_override, header, body).await?;
        index += 1;
    }
    Ok(())
}

use chrono::{DateTime, Local};
use crossterm::event::{KeyCode, KeyModifiers};
use reedline::{
    self, EditCommand, FileBackedHistory, Prompt, PromptEditMode, PromptHistorySearch,
    PromptHistorySearchStatus, PromptViMode, Reedline, ReedlineEvent, Vi,
    default_vi_insert_keybindings, default_vi_normal_keybindings,
};
use std::borrow::Cow;
use std::env;
use std::path::PathBuf;

use crate::config;

pub struct LineEditor {
    pub reedline: Reedline,
}

impl LineEditor {
    pub fn new() -> LineEditor {
        let mut insert_keybindings = default_vi_insert_keybindings();
        // A newline turns the submission into a cell-mode invocation:
        // header line + body.
        // Works for Konsole on Kubuntu Linux
        insert_keybindings.add_binding(
            KeyModifiers::ALT,
            KeyCode::Enter,
            ReedlineEvent::Edit(vec![EditCommand::InsertString("\n".to_string())]),
        );
        // Works for iTerm2 on Mac (fails on Terminal.app)
        // https://github.com/crossterm-rs/crossterm/issues/861
        insert_keybindings.add_binding(
            KeyModifiers::SHIFT,
            KeyCode::Enter,
            ReedlineEvent::Edit(vec![EditCommand::InsertString("\n".to_string())]),
        );

        let history = Box::new(
            FileBackedHistory::with_file(100, config::get_history_path())
                .expect("error: could not open history file"),
        );
        let reedline = Reedline::create()
            .use_bracketed_paste(true)
            .with_history(history)
            .with_edit_mode(Box::new(Vi::new(
                insert_keybindings,
                default_vi_normal_keybindings(),
            )))
            .with_ansi_colors(true);

        LineEditor { reedline }
    }
}

// ---

pub struct EditorPrompt {
    pub index: u32,
}

impl EditorPrompt {
    pub fn new() -> EditorPrompt {
        EditorPrompt { index: 0 }
    }

    pub fn set_index(&mut self, new_index: u32) {
        self.index = new_index;
    }
}

impl Prompt for EditorPrompt {
    fn render_prompt_left(&self) -> Cow<str> {
        Cow::Owned(format!("[{}]", self.index))
    }

    fn render_prompt_right(&self) -> Cow<str> {
        let now: DateTime<Local> = Local::now();
        let formatted_time = now.format("%m/%d/%y %I:%M:%S %p").to_string();
        Cow::Owned(format!("{} {}", abbreviate_cwd(), formatted_time))
    }

    fn render_prompt_indicator(&self, _edit_mode: PromptEditMode) -> Cow<str> {
        match _edit_mode {
            PromptEditMode::Custom(_)
            | PromptEditMode::Default
            | PromptEditMode::Vi(PromptViMode::Insert) => Cow::Borrowed(": "),
            PromptEditMode::Vi(PromptViMode::Normal) => Cow::Borrowed("〉"),
            _ => Cow::Borrowed("> "),
        }
    }

    fn render_prompt_multiline_indicator(&self) -> Cow<str> {
        Cow::Borrowed("::: ")
    }

    fn render_prompt_history_search_indicator(
        &self,
        history_search: PromptHistorySearch,
    ) -> Cow<str> {
        let prefix = match history_search.status {
            PromptHistorySearchStatus::Passing => "",
            PromptHistorySearchStatus::Failing => "failing ",
        };

        Cow::Owned(format!(
            "({}reverse-search: {}) ",
            prefix, history_search.term
        ))
    }
}

// --

pub struct QuestionPrompt {
    pub question: String,
}

impl QuestionPrompt {
    pub fn new(q: &str) -> QuestionPrompt {
        QuestionPrompt {
            question: q.to_string(),
        }
    }
}

impl Prompt for QuestionPrompt {
    fn render_prompt_left(&self) -> Cow<str> {
        Cow::Owned(format!("[QUESTION] {}", self.question))
    }

    fn render_prompt_right(&self) -> Cow<str> {
        Cow::Borrowed("")
    }

    fn render_prompt_indicator(&self, _edit_mode: PromptEditMode) -> Cow<str> {
        Cow::Borrowed(" ")
    }

    fn render_prompt_multiline_indicator(&self) -> Cow<str> {
        Cow::Borrowed("::: ")
    }

    fn render_prompt_history_search_indicator(
        &self,
        history_search: PromptHistorySearch,
    ) -> Cow<str> {
        let prefix = match history_search.status {
            PromptHistorySearchStatus::Passing => "",
            PromptHistorySearchStatus::Failing => "failing ",
        };

        Cow::Owned(format!(
            "({}reverse-search: {}) ",
            prefix, history_search.term
        ))
    }
}

// ---

fn abbreviate_cwd() -> String {
    let cwd = env::current_dir().expect("Failed to get current directory");
    abbreviate_path(cwd)
}

fn abbreviate_path(path: PathBuf) -> String {
    // Replace a home-dir prefix with '~'
    if let Some(home_dir) = dirs::home_dir() {
        if let Ok(stripped) = path.strip_prefix(&home_dir) {
            return format!("~/{}", stripped.display());
        }
    }
    path.display().to_string()
}

use reedline::{
    self, Reedline, Signal, Vi, default_vi_insert_keybindings, default_vi_normal_keybindings,
};

use crate::line_editor;

/// Asks a one-off question on its own prompt; `None` if the user cancels via
/// a signal (e.g. ctrl+c).
pub fn ask_question(prompt: &str) -> Option<String> {
    let mut reedline = Reedline::create()
        .use_bracketed_paste(true)
        .with_edit_mode(Box::new(Vi::new(
            default_vi_insert_keybindings(),
            default_vi_normal_keybindings(),
        )))
        .with_ansi_colors(true);
    let sig = reedline.read_line(&line_editor::QuestionPrompt::new(prompt));
    match sig {
        Ok(Signal::Success(answer)) => Some(answer.trim().to_string()),
        Ok(Signal::CtrlC) => None,
        Ok(Signal::CtrlD) => None,
        _ => None,
    }
}

use serde::Deserialize;
use std::error::Error;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Copilot web-session cookies. The BING_COOKIES env var takes
    /// precedence over this value.
    pub cookies: Option<String>,
}

pub fn get_config(config_path_override: &Option<String>) -> Result<Config, Box<dyn Error>> {
    let config: Config = toml::from_str(&read_config_as_string(config_path_override)?)?;
    Ok(config)
}

pub fn read_config_as_string(
    config_path_override: &Option<String>,
) -> Result<String, Box<dyn Error>> {
    let config_path = if let Some(config_path) = config_path_override {
        config_path.to_string()
    } else {
        let path = get_default_config_path();
        if !path.exists() {
            let default_config = r#"
# Copilot web-session cookies (the BING_COOKIES env var takes precedence).
# Prefer `sydney set-cookie <cookie>` over editing this by hand.
#cookies = "..."
"#;
            write_config(path.to_str().unwrap(), default_config);
        }
        path.to_str().unwrap().to_string()
    };
    Ok(fs::read_to_string(config_path)?)
}

pub fn create_config_dir_if_missing() -> Result<(), Box<dyn Error>> {
    let path = get_config_folder_path();
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

pub fn get_config_folder_path() -> PathBuf {
    let mut path = PathBuf::new();
    path.push(dirs::home_dir().unwrap());
    path.push(".sydney");
    path
}

pub fn get_default_config_path() -> PathBuf {
    let mut path = get_config_folder_path();
    path.push("sydney.toml");
    path
}

// ---

pub fn write_config(path: &str, cfg: &str) {
    if let Err(e) = fs::write(path, cfg) {
        eprintln!("Failed to write to config file: {}", e);
    }
}

pub fn insert_config_kv(config_path_override: &Option<String>, key: &String, val: &String) {
    let cfg = read_config_as_string(config_path_override).unwrap();
    let mut doc = cfg.parse::<toml_edit::DocumentMut>().expect("invalid doc");
    doc[key] = toml_edit::value(val);
    let config_path = config_path_override
        .clone()
        .unwrap_or(get_default_config_path().to_str().unwrap().to_string());
    write_config(&config_path, doc.to_string().as_str());
}

// ---

/// Resolves the Copilot credential: env var first, config file second.
pub fn get_cookies(cfg: &Config) -> Option<String> {
    std::env::var("BING_COOKIES")
        .ok()
        .filter(|c| !c.is_empty())
        .or(cfg.cookies.clone().filter(|c| !c.is_empty()))
}

pub const COOKIE_SETUP_MSG: &str = r#"No Copilot cookies are configured.

Go to the Copilot web page https://copilot.microsoft.com/.
Open the developer tools in your browser (usually by pressing F12 or
right-clicking on the chat dialog and selecting Inspect).
Select the Network tab to view all requests sent to Copilot.
Write a message on the chat dialog that appears on the web page.
Find a request named create?bundleVersion=XYZ and click on it.
Scroll down to the request headers section and copy the entire value after
the Cookie: field.

Then, set it as an environment variable in your shell:

  export BING_COOKIES=<your-cookies>

or save it in the config file:

  sydney set-cookie '<your-cookies>'
"#;

// ---

fn get_debug_log_path() -> PathBuf {
    let mut path = get_config_folder_path();
    path.push("debug.log");
    path
}

pub fn write_to_debug_log(log: String) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(get_debug_log_path())?;
    file.write_all(log.as_bytes())?;
    Ok(())
}

// ---

pub fn get_history_path() -> PathBuf {
    let mut path = get_config_folder_path();
    path.push("history");
    path
}

use colored::Colorize;

fn prefix() -> String {
    "[ckecli]".bold().cyan().to_string()
}

/// Print an informational message to stderr: [ckecli] message
pub fn info(msg: &str) {
    eprintln!("{} {}", prefix(), msg);
}

/// Print a success message to stderr (in green).
pub fn success(msg: &str) {
    eprintln!("{} {}", prefix(), msg.green());
}

/// Print an error message: [ckecli] ERROR: message (in red)
pub fn error(msg: &str) {
    eprintln!("{} {}", "[ckecli] ERROR:".bold().red(), msg.red());
}

/// Print a warning message (in yellow).
pub fn warn(msg: &str) {
    eprintln!("{} {}", prefix(), msg.yellow());
}

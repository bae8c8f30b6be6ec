//! Colored message helpers for interactive operator output.

use colored::Colorize;

fn prefix() -> String {
    "[cloudctl]".bold().cyan().to_string()
}

pub fn info(msg: &str) {
    println!("{} {}", prefix(), msg);
}

pub fn success(msg: &str) {
    println!("{} {}", prefix(), msg.green());
}

pub fn error(msg: &str) {
    eprintln!("{} {}", "[cloudctl]".bold().red(), msg.red());
}

pub fn warn(msg: &str) {
    println!("{} {}", prefix(), msg.yellow());
}

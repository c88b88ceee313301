//! Operator-facing terminal output. Progress in green, problems in red, lists
//! in blue, every line tagged with the `[MP]` prefix.

use console::style;

pub(crate) fn heading(text: &str) {
    println!("{}", style(format!("[MP] {}", text)).bold());
}

pub(crate) fn good(text: &str) {
    for line in text.lines() {
        println!("{}", style(format!("[MP]   {}", line)).green());
    }
}

pub(crate) fn warning(text: &str) {
    for line in text.lines() {
        println!("{}", style(format!("[MP]   {}", line)).red());
    }
}

/// Prints the items numbered from 1, in the given order.
pub(crate) fn numbered(items: &[String]) {
    for (index, item) in items.iter().enumerate() {
        println!("{}", style(format!("[MP]   {}.   {}", index + 1, item)).blue());
    }
}

pub(crate) fn tool_output(stdout: &str, stderr: &str) {
    for line in stdout.lines().chain(stderr.lines()) {
        println!("{}", style(format!("[MP]   | {}", line)).dim());
    }
}

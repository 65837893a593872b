use console::style;
use dialoguer::{theme::ColorfulTheme, Input, Password};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Print success message
pub fn success(msg: &str) {
    println!("{} {}", style("✔").green(), msg);
}

/// Print error message
pub fn error(msg: &str) {
    println!("{} {}", style("✖").red(), msg);
}

/// Print info message (indented)
pub fn info(msg: &str) {
    println!("  {}", msg);
}

pub fn header(msg: &str) {
    println!();
    println!("  {}", style(msg).bold());
    println!("  {}", "─".repeat(45));
}

/// `label   value` row under a header.
pub fn row(label: &str, value: &str) {
    println!("  {:<14} {}", label, value);
}

pub fn dim(msg: &str) -> String {
    style(msg).dim().to_string()
}

/// Prompt for a secret (masked input)
pub fn prompt_password(prompt: &str) -> anyhow::Result<String> {
    let value = Password::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .interact()?;
    Ok(value)
}

pub fn prompt_input(prompt: &str) -> anyhow::Result<String> {
    let value = Input::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .interact_text()?;
    Ok(value)
}

/// Create a spinner for indeterminate progress
pub fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Print background task notice
pub fn background_notice(msg: &str, hint: &str) {
    println!("{} {}", style("💤").dim(), msg);
    println!("   {}", style(hint).dim());
}

//! Terminal output: spinners and coloured results.
//!
//! Uses `indicatif` for the spinner and `console` for styling.
//! [`TransitionProgress`] follows one transition job in the terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use statewright::{JobStatus, State, TransitionLog};

pub struct TransitionProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
}

impl TransitionProgress {
    pub fn start(from: &State, to: &State) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("{from} -> {to}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
        }
    }

    /// Stops the spinner and prints the job outcome.
    pub fn complete(&self, to: &State, status: &JobStatus) {
        self.pb.finish_and_clear();
        match status {
            JobStatus::Succeeded => {
                println!("  {} Moved to {to}", self.green.apply_to("✓"));
            }
            other => {
                println!(
                    "  {} Transition to {to} did not complete: {other}",
                    self.red.apply_to("✗")
                );
            }
        }
    }
}

pub fn print_summary(title: &str, lines: &[String]) {
    let bold = Style::new().bold();
    println!("{}", bold.apply_to(title));
    for line in lines {
        println!("  {line}");
    }
}

/// Prints the transition log as pretty JSON.
pub fn print_history(logs: &[TransitionLog]) {
    println!();
    println!("{}", Style::new().cyan().apply_to("─── Transition Log ───"));
    println!("{}", serde_json::to_string_pretty(logs).unwrap_or_default());
}

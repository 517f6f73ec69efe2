//! Terminal output helpers

use colored::Colorize;
use idler_lib::{IdleEvent, IdleReport};

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Render the orchestrator's report in the order events happened.
pub fn print_report(report: &IdleReport) {
    let dry_run = if report.dry_run { " (dry run)" } else { "" };

    for event in &report.events {
        match event {
            IdleEvent::Warning(message) => print_warning(message),
            IdleEvent::Failed(message) => print_error(message),
            IdleEvent::Marked { endpoint } => print_success(&format!(
                "The service \"{endpoint}\" has been marked as idled{dry_run}"
            )),
            IdleEvent::WillUnidle {
                endpoint,
                reference,
                replicas,
            } => print_info(&format!(
                "The service will unidle {} \"{}/{}\" to {} replicas once it receives traffic{dry_run}",
                reference.kind, endpoint.namespace, reference.name, replicas
            )),
            IdleEvent::Idled {
                namespace,
                reference,
            } => print_success(&format!(
                "{} \"{}/{}\" has been idled{dry_run}",
                reference.kind, namespace, reference.name
            )),
        }
    }
}

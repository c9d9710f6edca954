//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

fn table<T: TableDisplay>(items: &[T]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(T::headers());
    for item in items {
        table.add_row(item.row());
    }
    table
}

/// Serialize `value` as JSON or YAML
pub fn render_structured<T: Serialize + ?Sized>(value: &T, format: OutputFormat) -> anyhow::Result<String> {
    Ok(match format {
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
        _ => serde_json::to_string_pretty(value)?,
    })
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("No resources recorded.");
            } else {
                println!("{}", table(items));
            }
        }
        OutputFormat::Json | OutputFormat::Yaml => {
            println!("{}", render_structured(items, format)?.trim_end());
        }
    }
    Ok(())
}

/// Print a single serializable value
pub fn print_value<T: Serialize + ?Sized>(value: &T, format: OutputFormat) -> anyhow::Result<()> {
    let format = match format {
        OutputFormat::Table => OutputFormat::Json,
        other => other,
    };
    println!("{}", render_structured(value, format)?.trim_end());
    Ok(())
}

/// Print success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    eprintln!("{} {}", "!".yellow().bold(), message);
}

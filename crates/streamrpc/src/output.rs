use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Print the outputs of a JSON call, in arrival order.
///
/// `json` and `raw` write one compact value per line so the result can be
/// piped into line-oriented tools.
pub fn print_outputs(method: &str, outputs: &[Value], format: OutputFormat) {
    match format {
        OutputFormat::Json | OutputFormat::Raw => {
            for output in outputs {
                println!("{output}");
            }
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["#", "METHOD", "OUTPUT"]);
            for (index, output) in outputs.iter().enumerate() {
                table.add_row(vec![index.to_string(), method.to_string(), output.to_string()]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for output in outputs {
                println!(
                    "{}",
                    serde_json::to_string_pretty(output).unwrap_or_else(|_| output.to_string())
                );
            }
        }
    }
}

#[derive(Serialize)]
struct RawCallOutput<'a> {
    method: &'a str,
    result: &'a Value,
    payload_size: usize,
    payload: String,
}

/// Print the leading result and payload of a raw call. `raw` writes only the
/// payload bytes.
pub fn print_raw_call(method: &str, result: &Value, payload: &[u8], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = RawCallOutput {
                method,
                result,
                payload_size: payload.len(),
                payload: payload_preview(payload),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["METHOD", "RESULT", "SIZE", "PAYLOAD"])
                .add_row(vec![
                    method.to_string(),
                    result.to_string(),
                    payload.len().to_string(),
                    payload_preview(payload),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "method={method} result={result} size={} payload={}",
                payload.len(),
                payload_preview(payload)
            );
        }
        OutputFormat::Raw => print_raw(payload),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

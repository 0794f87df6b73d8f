use colored::Colorize;
use serde_json::Value;

pub struct Formatter {
    format: OutputFormat,
    color: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    JsonPretty,
    Csv,
    Line,
}

impl Formatter {
    pub fn new(format: &str, color: bool) -> Self {
        let format = match format.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "jsonpretty" | "json-pretty" => OutputFormat::JsonPretty,
            "csv" => OutputFormat::Csv,
            "line" => OutputFormat::Line,
            _ => OutputFormat::Table,
        };

        Self { format, color }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// # Brief
    /// 渲染结果行
    ///
    /// # Arguments
    /// * `rows` - JSON 对象形式的结果行
    pub fn render_rows(&self, rows: &[Value]) -> String {
        if rows.is_empty() && !matches!(self.format, OutputFormat::Json | OutputFormat::JsonPretty) {
            return if self.color {
                "No rows.".dimmed().to_string()
            } else {
                "No rows.".to_string()
            };
        }
        match self.format {
            OutputFormat::Table => self.render_table(rows),
            OutputFormat::Json => render_json(&Value::Array(rows.to_vec()), false),
            OutputFormat::JsonPretty => render_json(&Value::Array(rows.to_vec()), true),
            OutputFormat::Csv => render_csv(rows),
            OutputFormat::Line => self.render_line(rows),
        }
    }

    pub fn render_count(&self, count: u64) -> String {
        match self.format {
            OutputFormat::Json | OutputFormat::JsonPretty => format!("{{\"count\":{}}}", count),
            _ => format!("count: {}", count),
        }
    }

    fn header(&self, name: &str) -> String {
        if self.color {
            name.cyan().bold().to_string()
        } else {
            name.to_string()
        }
    }

    fn render_table(&self, rows: &[Value]) -> String {
        let columns = columns(rows);
        let cells: Vec<Vec<String>> = rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|col| row.get(col).map(format_value).unwrap_or_default())
                    .collect()
            })
            .collect();

        let mut widths: Vec<usize> = columns.iter().map(|c| c.chars().count()).collect();
        for row in &cells {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }

        let separator = widths
            .iter()
            .map(|w| "-".repeat(*w + 2))
            .collect::<Vec<_>>()
            .join("+");
        let header_row = columns
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!(" {}{} ", self.header(c), pad(c, *w)))
            .collect::<Vec<_>>()
            .join("|");

        let mut out = Vec::with_capacity(cells.len() + 4);
        out.push(format!("+{}+", separator));
        out.push(format!("|{}|", header_row));
        out.push(format!("+{}+", separator));
        for row in &cells {
            let line = row
                .iter()
                .zip(&widths)
                .map(|(cell, w)| format!(" {}{} ", cell, pad(cell, *w)))
                .collect::<Vec<_>>()
                .join("|");
            out.push(format!("|{}|", line));
        }
        out.push(format!("+{}+", separator));
        out.join("\n")
    }

    fn render_line(&self, rows: &[Value]) -> String {
        let mut out = Vec::new();
        for (i, row) in rows.iter().enumerate() {
            if i > 0 {
                out.push("-".repeat(40));
            }
            if let Value::Object(map) = row {
                for (key, value) in map {
                    let key = if self.color {
                        key.cyan().to_string()
                    } else {
                        key.clone()
                    };
                    out.push(format!("{}: {}", key, format_value(value)));
                }
            }
        }
        out.join("\n")
    }
}

pub fn render_json(value: &Value, pretty: bool) -> String {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    rendered.unwrap_or_default()
}

/// 列按首次出现的顺序排列
fn columns(rows: &[Value]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        if let Value::Object(map) = row {
            for key in map.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
        }
    }
    columns
}

fn render_csv(rows: &[Value]) -> String {
    let columns = columns(rows);
    let mut out = vec![columns.join(",")];
    for row in rows {
        let line: Vec<String> = columns
            .iter()
            .map(|col| row.get(col).map(|v| csv_escape(&format_value(v))).unwrap_or_default())
            .collect();
        out.push(line.join(","));
    }
    out.join("\n")
}

fn pad(cell: &str, width: usize) -> String {
    " ".repeat(width.saturating_sub(cell.chars().count()))
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(format_value).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(map) => {
            let items: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", k, format_value(v)))
                .collect();
            format!("{{{}}}", items.join(", "))
        }
    }
}

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

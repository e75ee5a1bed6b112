use accountdb_db::{
    ColumnInfo, HealthReport, IndexInfo, MigrationRun, MigrationStatus, ScriptReport, StepOutcome,
};
use anyhow::Result;
use serde::Serialize;

/// Box-drawn table sized to its widest cell per column.
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn row(&mut self, cells: Vec<String>) {
        self.rows.push(cells);
    }

    pub fn render(&self) -> String {
        let widths: Vec<usize> = (0..self.headers.len())
            .map(|i| {
                self.rows
                    .iter()
                    .filter_map(|r| r.get(i))
                    .chain(std::iter::once(&self.headers[i]))
                    .map(|c| c.chars().count())
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let rule = |left: &str, mid: &str, right: &str| {
            let parts: Vec<String> = widths.iter().map(|w| "─".repeat(w + 2)).collect();
            format!("{left}{}{right}", parts.join(mid))
        };
        let line = |cells: &[String]| {
            let parts: Vec<String> = widths
                .iter()
                .enumerate()
                .map(|(i, &w)| {
                    let cell = cells.get(i).map(String::as_str).unwrap_or("");
                    format!(" {cell:<w$} ")
                })
                .collect();
            format!("│{}│", parts.join("│"))
        };

        let mut out = vec![rule("╭", "┬", "╮"), line(&self.headers), rule("├", "┼", "┤")];
        out.extend(self.rows.iter().map(|r| line(r)));
        out.push(rule("╰", "┴", "╯"));
        out.join("\n")
    }
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn outcome_label(outcome: StepOutcome) -> &'static str {
    match outcome {
        StepOutcome::Applied => "applied",
        StepOutcome::AlreadyPresent => "already present",
        StepOutcome::Absent => "already absent",
    }
}

fn yes_no(v: bool) -> String {
    let label = if v { "yes" } else { "no" };
    label.to_string()
}

pub fn print_tables(tables: &[String]) {
    let mut table = Table::new(&["table"]);
    for name in tables {
        table.row(vec![name.clone()]);
    }
    println!("{}", table.render());
}

pub fn print_runs(runs: &[MigrationRun]) {
    if runs.is_empty() {
        println!("Schema is up to date.");
        return;
    }
    for run in runs {
        println!("Migration {} ({}) {:?}", run.version, run.name, run.direction);
        let mut table = Table::new(&["step", "outcome"]);
        for step in &run.steps {
            table.row(vec![step.step.clone(), outcome_label(step.outcome).to_string()]);
        }
        println!("{}", table.render());
    }
}

pub fn print_status(status: &[MigrationStatus]) {
    let mut table = Table::new(&["version", "name", "applied at"]);
    for s in status {
        table.row(vec![
            s.version.to_string(),
            s.name.clone(),
            s.applied_at.clone().unwrap_or_else(|| "pending".to_string()),
        ]);
    }
    println!("{}", table.render());
}

pub fn print_columns(columns: &[ColumnInfo]) {
    let mut table = Table::new(&["column", "type", "nullable", "default"]);
    for c in columns {
        table.row(vec![
            c.name.clone(),
            c.declared_type.clone(),
            yes_no(c.nullable),
            c.default.clone().unwrap_or_else(|| "-".to_string()),
        ]);
    }
    println!("{}", table.render());
}

pub fn print_indexes(indexes: &[IndexInfo]) {
    let mut table = Table::new(&["index", "columns", "partial", "definition"]);
    for i in indexes {
        table.row(vec![
            i.name.clone(),
            i.columns.join(", "),
            yes_no(i.partial),
            i.definition.clone().unwrap_or_else(|| "-".to_string()),
        ]);
    }
    println!("{}", table.render());
}

pub fn print_health(report: &HealthReport) {
    println!("SQLite {}", report.engine_version);
    let mut table = Table::new(&["table", "rows"]);
    for t in &report.tables {
        table.row(vec![t.name.clone(), t.rows.to_string()]);
    }
    println!("{}", table.render());
}

pub fn print_script(report: &ScriptReport) {
    println!(
        "{} statement{} executed, {} skipped (already present)",
        report.executed,
        if report.executed == 1 { "" } else { "s" },
        report.skipped
    );
}

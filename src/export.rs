use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rust_xlsxwriter::{Workbook, Worksheet};

use crate::game_log::{Stat, format_date};
use crate::projection::ProjectionRecord;
use crate::training::write_atomic;

pub const CSV_FILE: &str = "projections_latest.csv";
pub const XLSX_FILE: &str = "projections_latest.xlsx";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExportReport {
    pub rows: usize,
    pub csv: Option<PathBuf>,
    pub xlsx: Option<PathBuf>,
}

/// Descending by the salience statistic (minutes when it was not projected), then player id.
pub fn sort_for_output(records: &mut [ProjectionRecord], salience: Stat) {
    let key = |r: &ProjectionRecord| r.value(salience).unwrap_or(r.minutes);
    records.sort_by(|a, b| {
        key(b)
            .partial_cmp(&key(a))
            .unwrap_or(Ordering::Equal)
            .then(a.player_id.cmp(&b.player_id))
    });
}

fn header(stats: &[Stat]) -> Vec<String> {
    let mut out = vec![
        "player_id".to_string(),
        "player_name".to_string(),
        "team".to_string(),
        "date".to_string(),
        "minutes".to_string(),
    ];
    out.extend(stats.iter().map(|s| s.key().to_string()));
    out
}

fn cells(record: &ProjectionRecord, stats: &[Stat]) -> Vec<String> {
    let mut out = vec![
        record.player_id.to_string(),
        record.player_name.clone(),
        record.team_abbrev.clone(),
        format_date(record.projection_date),
        format!("{:.2}", record.minutes),
    ];
    for stat in stats {
        out.push(record.value(*stat).map(|v| format!("{v:.2}")).unwrap_or_default());
    }
    out
}

pub fn render_csv(records: &[ProjectionRecord], stats: &[Stat]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(header(stats)).context("write csv header")?;
    for record in records {
        writer
            .write_record(cells(record, stats))
            .with_context(|| format!("write csv row for player {}", record.player_id))?;
    }
    writer.into_inner().context("flush csv")
}

fn write_xlsx(path: &Path, records: &[ProjectionRecord], stats: &[Stat]) -> Result<()> {
    let mut workbook = Workbook::new();
    {
        let sheet = workbook.add_worksheet();
        sheet.set_name("Projections")?;
        write_sheet(sheet, records, stats)?;
    }
    let tmp = path.with_file_name(format!("{XLSX_FILE}.tmp"));
    workbook
        .save(&tmp)
        .with_context(|| format!("failed writing workbook to {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("rename {}", tmp.display()))?;
    Ok(())
}

fn write_sheet(sheet: &mut Worksheet, records: &[ProjectionRecord], stats: &[Stat]) -> Result<()> {
    for (col, name) in header(stats).iter().enumerate() {
        sheet
            .write_string(0, col as u16, name)
            .with_context(|| format!("write header cell {col}"))?;
    }
    for (idx, record) in records.iter().enumerate() {
        let row = idx as u32 + 1;
        sheet.write_number(row, 0, record.player_id as f64)?;
        sheet.write_string(row, 1, &record.player_name)?;
        sheet.write_string(row, 2, &record.team_abbrev)?;
        sheet.write_string(row, 3, format_date(record.projection_date))?;
        sheet.write_number(row, 4, record.minutes)?;
        for (offset, stat) in stats.iter().enumerate() {
            if let Some(v) = record.value(*stat) {
                sheet.write_number(row, 5 + offset as u16, v)?;
            }
        }
    }
    Ok(())
}

pub fn export(
    dir: &Path,
    records: &[ProjectionRecord],
    stats: &[Stat],
    salience: Stat,
    with_xlsx: bool,
) -> Result<ExportReport> {
    fs::create_dir_all(dir).with_context(|| format!("create output dir {}", dir.display()))?;
    let mut sorted = records.to_vec();
    sort_for_output(&mut sorted, salience);

    let csv_path = dir.join(CSV_FILE);
    write_atomic(&csv_path, &render_csv(&sorted, stats)?)?;

    let xlsx = if with_xlsx {
        let path = dir.join(XLSX_FILE);
        write_xlsx(&path, &sorted, stats)?;
        Some(path)
    } else {
        None
    };

    Ok(ExportReport {
        rows: sorted.len(),
        csv: Some(csv_path),
        xlsx,
    })
}

//! Trace position summary: each fiber's row at three representative columns.
//!
//! The table is printable through [`Display`](std::fmt::Display) and can be written as
//! CSV for instrument monitoring.
use std::{fmt, fs::File, io::Write};

use camino::Utf8Path;
use comfy_table::{presets::UTF8_FULL, Cell, CellAlignment, ContentArrangement, Row, Table};

use crate::{constants::FiberNumber, fiber::registry::FiberRegistry, panacea_errors::PanaceaError};

#[derive(Debug, Clone, PartialEq)]
pub struct TraceSummaryRow {
    pub fibnum: FiberNumber,
    pub dead: bool,
    pub rows: [f64; 3],
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceSummary {
    /// Sampled columns: `D/6`, `D/2`, `5D/6`.
    pub columns: [usize; 3],
    pub fibers: Vec<TraceSummaryRow>,
}

impl TraceSummary {
    /// Sample the traces of every fiber.
    ///
    /// Return
    /// ----------
    /// * [`PanaceaError::MissingStageOutput`] if a fiber has no trace.
    pub fn from_fibers(fibers: &FiberRegistry) -> Result<Self, PanaceaError> {
        let d = fibers.columns();
        let columns = [d / 6, d / 2, 5 * d / 6];
        let rows = fibers
            .iter()
            .map(|fiber| {
                let trace = fiber.trace_values()?;
                Ok(TraceSummaryRow {
                    fibnum: fiber.fibnum,
                    dead: fiber.dead,
                    rows: columns.map(|c| trace.get(c).copied().unwrap_or(f64::NAN)),
                })
            })
            .collect::<Result<Vec<_>, PanaceaError>>()?;
        Ok(TraceSummary {
            columns,
            fibers: rows,
        })
    }

    /// Write the summary as CSV (`fiber,dead,y_<c1>,y_<c2>,y_<c3>`).
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), PanaceaError> {
        let mut wtr = csv::Writer::from_writer(writer);
        let [c1, c2, c3] = self.columns;
        wtr.write_record([
            "fiber".to_string(),
            "dead".to_string(),
            format!("y_{c1}"),
            format!("y_{c2}"),
            format!("y_{c3}"),
        ])?;
        for row in &self.fibers {
            wtr.write_record([
                row.fibnum.to_string(),
                row.dead.to_string(),
                format!("{:.4}", row.rows[0]),
                format!("{:.4}", row.rows[1]),
                format!("{:.4}", row.rows[2]),
            ])?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn write_csv_file(&self, path: &Utf8Path) -> Result<(), PanaceaError> {
        self.write_csv(File::create(path)?)
    }
}

impl fmt::Display for TraceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic);
        let [c1, c2, c3] = self.columns;
        table.set_header(vec![
            Cell::new("Fiber"),
            Cell::new("Dead"),
            Cell::new(format!("y @ col {c1}")),
            Cell::new(format!("y @ col {c2}")),
            Cell::new(format!("y @ col {c3}")),
        ]);
        for row in &self.fibers {
            table.add_row(Row::from(vec![
                Cell::new(row.fibnum).set_alignment(CellAlignment::Right),
                Cell::new(if row.dead { "yes" } else { "" }),
                Cell::new(format!("{:.3}", row.rows[0])).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.3}", row.rows[1])).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.3}", row.rows[2])).set_alignment(CellAlignment::Right),
            ]));
        }
        write!(f, "{table}")
    }
}

#[cfg(test)]
mod summary_test {
    use super::*;

    #[test]
    fn test_summary_csv_and_table() {
        let mut fibers = FiberRegistry::new(12);
        fibers.ensure_len(2);
        for (i, fiber) in fibers.iter_mut().enumerate() {
            fiber.trace = Some((0..12).map(|c| 5.0 + 8.0 * i as f64 + 0.1 * c as f64).collect());
        }
        fibers[1].dead = true;

        let summary = TraceSummary::from_fibers(&fibers).unwrap();
        assert_eq!(summary.columns, [2, 6, 10]);

        let mut buf = Vec::new();
        summary.write_csv(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "fiber,dead,y_2,y_6,y_10");
        assert_eq!(lines[2], "2,true,13.2000,13.6000,14.0000");

        let rendered = summary.to_string();
        assert!(rendered.contains("y @ col 6"));
        assert!(rendered.contains("13.600"));
    }
}

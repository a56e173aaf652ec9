//! Streaming reader for LAMMPS text dump files.
//!
//! Only the layout the propensity pipeline needs is understood: frames made of
//! `ITEM: TIMESTEP`, `ITEM: NUMBER OF ATOMS`, `ITEM: BOX BOUNDS` (three lines)
//! and `ITEM: ATOMS <columns>` followed by one row per atom.

use anyhow::{Context, Result};
use log::trace;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use trajectory_common::{Atom, Snapshot};

/// Header of one dump frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameHeader {
    pub timestep: u64,
    pub num_atoms: usize,
    /// (lo, hi) per box dimension, as written in the frame.
    pub bounds: Vec<(f64, f64)>,
    pub columns: Vec<String>,
}

impl FrameHeader {
    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| anyhow::anyhow!(
                "Column '{}' not present at timestep {} (columns: {}).",
                name,
                self.timestep,
                self.columns.join(" ")
            ))
    }
}

pub struct DumpReader<R> {
    reader: R,
    buf: String,
    line_no: usize,
    source: String,
    /// Column names used instead of the `ITEM: ATOMS` header names.
    columns_override: Option<Vec<String>>,
}

impl DumpReader<BufReader<File>> {
    /// Opens a dump file for streaming.
    pub fn open<P: AsRef<Path>>(path: P, columns_override: Option<Vec<String>>) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("Failed to open dump file: {}", path_ref.display()))?;
        Ok(Self::new(BufReader::new(file), path_ref.display().to_string(), columns_override))
    }
}

impl<R: BufRead> DumpReader<R> {
    pub fn new(reader: R, source: String, columns_override: Option<Vec<String>>) -> Self {
        DumpReader { reader, buf: String::new(), line_no: 0, source, columns_override }
    }

    fn location(&self) -> String {
        format!("{}:{}", self.source, self.line_no)
    }

    /// Reads the next line into `self.buf`. Returns false at end of file.
    fn advance(&mut self) -> Result<bool> {
        self.buf.clear();
        let n = self
            .reader
            .read_line(&mut self.buf)
            .with_context(|| format!("Failed to read {}", self.location()))?;
        if n == 0 {
            return Ok(false);
        }
        self.line_no += 1;
        Ok(true)
    }

    fn require_line(&mut self, what: &str) -> Result<()> {
        if !self.advance()? {
            anyhow::bail!("{}: unexpected end of file, expected {}.", self.location(), what);
        }
        Ok(())
    }

    fn expect_item(&mut self, item: &str) -> Result<String> {
        self.require_line(item)?;
        let line = self.buf.trim();
        match line.strip_prefix("ITEM: ") {
            Some(rest) if rest.starts_with(item) => Ok(rest[item.len()..].trim().to_string()),
            _ => anyhow::bail!("{}: expected 'ITEM: {}', found '{}'.", self.location(), item, line),
        }
    }

    fn parse_value<T: std::str::FromStr>(&self, what: &str) -> Result<T> {
        let line = self.buf.trim();
        line.parse::<T>()
            .map_err(|_| anyhow::anyhow!("{}: invalid {} '{}'.", self.location(), what, line))
    }

    /// Reads the next frame header, or `None` at end of file.
    pub fn read_header(&mut self) -> Result<Option<FrameHeader>> {
        // Skip blank lines between frames.
        loop {
            if !self.advance()? {
                return Ok(None);
            }
            if !self.buf.trim().is_empty() {
                break;
            }
        }
        let first = self.buf.trim();
        if first != "ITEM: TIMESTEP" {
            anyhow::bail!("{}: expected 'ITEM: TIMESTEP', found '{}'.", self.location(), first);
        }
        self.require_line("timestep value")?;
        let timestep: u64 = self.parse_value("timestep")?;

        self.expect_item("NUMBER OF ATOMS")?;
        self.require_line("atom count")?;
        let num_atoms: usize = self.parse_value("atom count")?;

        self.expect_item("BOX BOUNDS")?;
        let mut bounds = Vec::with_capacity(3);
        for _ in 0..3 {
            self.require_line("box bounds")?;
            let mut fields = self.buf.split_whitespace().map(str::parse::<f64>);
            match (fields.next(), fields.next()) {
                (Some(Ok(lo)), Some(Ok(hi))) => bounds.push((lo, hi)),
                _ => anyhow::bail!("{}: invalid box bounds '{}'.", self.location(), self.buf.trim()),
            }
        }

        let header_columns = self.expect_item("ATOMS")?;
        let columns = match &self.columns_override {
            Some(columns) => columns.clone(),
            None => header_columns.split_whitespace().map(str::to_string).collect(),
        };
        if columns.is_empty() {
            anyhow::bail!(
                "{}: 'ITEM: ATOMS' names no columns; configure the column names explicitly.",
                self.location()
            );
        }

        Ok(Some(FrameHeader { timestep, num_atoms, bounds, columns }))
    }

    fn skip_rows(&mut self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.require_line("atom row")?;
        }
        Ok(())
    }

    fn read_atoms(&mut self, header: &FrameHeader, x_col: &str, y_col: &str) -> Result<Snapshot> {
        let id_idx = header.column_index("id")?;
        let type_idx = header.column_index("type")?;
        let x_idx = header.column_index(x_col)?;
        let y_idx = header.column_index(y_col)?;
        let width = header.columns.len();

        let mut atoms = Vec::with_capacity(header.num_atoms);
        for _ in 0..header.num_atoms {
            self.require_line("atom row")?;
            let fields: Vec<&str> = self.buf.split_whitespace().collect();
            if fields.len() < width {
                anyhow::bail!(
                    "{}: atom row has {} fields, header names {}.",
                    self.location(),
                    fields.len(),
                    width
                );
            }
            let id = parse_integer(fields[id_idx])
                .ok_or_else(|| anyhow::anyhow!("{}: invalid atom id '{}'.", self.location(), fields[id_idx]))?;
            let atom_type = parse_integer(fields[type_idx])
                .and_then(|t| u32::try_from(t).ok())
                .ok_or_else(|| anyhow::anyhow!("{}: invalid atom type '{}'.", self.location(), fields[type_idx]))?;
            let x = fields[x_idx]
                .parse::<f64>()
                .map_err(|_| anyhow::anyhow!("{}: invalid {} '{}'.", self.location(), x_col, fields[x_idx]))?;
            let y = fields[y_idx]
                .parse::<f64>()
                .map_err(|_| anyhow::anyhow!("{}: invalid {} '{}'.", self.location(), y_col, fields[y_idx]))?;
            atoms.push(Atom::new(id, atom_type, x, y));
        }

        Snapshot::from_atoms(header.timestep, atoms)
            .with_context(|| format!("Invalid frame in {}", self.source))
    }

    /// Returns the next frame whose timestep satisfies `keep`, as a snapshot
    /// positioned by the `x_col`/`y_col` columns. Other frames are skipped
    /// without parsing their rows.
    pub fn next_snapshot<F>(&mut self, keep: F, x_col: &str, y_col: &str) -> Result<Option<Snapshot>>
    where
        F: Fn(u64) -> bool,
    {
        while let Some(header) = self.read_header()? {
            if !keep(header.timestep) {
                trace!("Skipping timestep {} in {}", header.timestep, self.source);
                self.skip_rows(header.num_atoms)?;
                continue;
            }
            trace!(
                "Reading timestep {} ({} atoms, box {:?}) from {}",
                header.timestep,
                header.num_atoms,
                header.bounds,
                self.source
            );
            return self.read_atoms(&header, x_col, y_col).map(Some);
        }
        Ok(None)
    }
}

/// Scans `path` for `timestep` and returns that frame as a snapshot.
pub fn read_snapshot<P: AsRef<Path>>(
    path: P,
    columns_override: Option<Vec<String>>,
    timestep: u64,
    x_col: &str,
    y_col: &str,
) -> Result<Snapshot> {
    let path_ref = path.as_ref();
    let mut reader = DumpReader::open(path_ref, columns_override)?;
    reader
        .next_snapshot(|t| t == timestep, x_col, y_col)?
        .ok_or_else(|| anyhow::anyhow!("Timestep {} not found in {}.", timestep, path_ref.display()))
}

// Dumps written with floating point formats may print integer fields as "12.0".
fn parse_integer(field: &str) -> Option<u64> {
    if let Ok(v) = field.parse::<u64>() {
        return Some(v);
    }
    field.parse::<f64>().ok().and_then(integer_value)
}

/// A non-negative whole float as an integer; NaN, fractions and negatives are rejected.
pub(crate) fn integer_value(v: f64) -> Option<u64> {
    if v >= 0.0 && v.fract() == 0.0 && v <= u64::MAX as f64 {
        Some(v as u64)
    } else {
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// Writes one dump frame with columns `id type xu yu x y`.
    pub(crate) fn frame_text(timestep: u64, atoms: &[(u64, u32, f64, f64, f64, f64)]) -> String {
        let mut s = format!(
            "ITEM: TIMESTEP\n{}\nITEM: NUMBER OF ATOMS\n{}\nITEM: BOX BOUNDS pp pp pp\n0 10\n0 10\n-0.5 0.5\nITEM: ATOMS id type xu yu x y\n",
            timestep,
            atoms.len()
        );
        for (id, t, xu, yu, x, y) in atoms {
            s.push_str(&format!("{} {} {} {} {} {}\n", id, t, xu, yu, x, y));
        }
        s
    }

    fn reader(text: String) -> DumpReader<Cursor<Vec<u8>>> {
        DumpReader::new(Cursor::new(text.into_bytes()), "test.dump".to_string(), None)
    }

    #[test]
    fn reads_header_and_sorts_atoms() {
        let text = frame_text(100, &[(2, 1, 1.5, 2.5, 1.0, 2.0), (1, 2, 0.5, 0.25, 0.5, 0.25)]);
        let mut r = reader(text);
        let snap = r.next_snapshot(|_| true, "xu", "yu").unwrap().unwrap();
        assert_eq!(snap.timestep, 100);
        assert_eq!(snap.ids().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(snap.atoms()[0].atom_type, 2);
        assert_eq!(snap.atoms()[1].pos.x, 1.5);
        assert!(r.next_snapshot(|_| true, "xu", "yu").unwrap().is_none());
    }

    #[test]
    fn skips_unwanted_frames() {
        let text = format!(
            "{}\n{}",
            frame_text(0, &[(1, 1, 0.0, 0.0, 0.0, 0.0)]),
            frame_text(10, &[(1, 1, 3.0, 4.0, 9.0, 9.5)])
        );
        let mut r = reader(text);
        let snap = r.next_snapshot(|t| t == 10, "x", "y").unwrap().unwrap();
        assert_eq!(snap.timestep, 10);
        assert_eq!(snap.atoms()[0].pos.y, 9.5);
    }

    #[test]
    fn column_override_names_headerless_dumps() {
        let text = "ITEM: TIMESTEP\n5\nITEM: NUMBER OF ATOMS\n1\nITEM: BOX BOUNDS\n0 1\n0 1\n0 1\nITEM: ATOMS\n7 1 0.25 0.75\n".to_string();
        let columns = Some(vec!["id".to_string(), "type".to_string(), "xu".to_string(), "yu".to_string()]);
        let mut r = DumpReader::new(Cursor::new(text.clone().into_bytes()), "t".to_string(), columns);
        let snap = r.next_snapshot(|_| true, "xu", "yu").unwrap().unwrap();
        assert_eq!(snap.atoms()[0].id, 7);

        let mut bare = reader(text);
        assert!(bare.next_snapshot(|_| true, "xu", "yu").is_err());
    }

    #[test]
    fn truncated_frame_reports_location() {
        let mut text = frame_text(0, &[(1, 1, 0.0, 0.0, 0.0, 0.0), (2, 1, 0.0, 0.0, 0.0, 0.0)]);
        text.truncate(text.trim_end().rfind('\n').unwrap() + 1);
        let err = reader(text).next_snapshot(|_| true, "xu", "yu").unwrap_err();
        assert!(err.to_string().contains("unexpected end of file"), "{}", err);
    }

    #[test]
    fn missing_column_is_an_error() {
        let text = frame_text(0, &[(1, 1, 0.0, 0.0, 0.0, 0.0)]);
        let err = reader(text).next_snapshot(|_| true, "xs", "ys").unwrap_err();
        assert!(err.to_string().contains("Column 'xs'"));
    }

    #[test]
    fn integer_fields_accept_float_spelling() {
        assert_eq!(parse_integer("12"), Some(12));
        assert_eq!(parse_integer("12.0"), Some(12));
        assert_eq!(parse_integer("1.5"), None);
        assert_eq!(parse_integer("-1"), None);
        assert_eq!(integer_value(f64::NAN), None);
        assert_eq!(integer_value(3.0), Some(3));
    }

    #[test]
    fn atom_type_beyond_u32_is_rejected() {
        let text = frame_text(0, &[(1, 1, 0.0, 0.0, 0.0, 0.0)]).replace("\n1 1 0 0 0 0\n", "\n1 4294967296 0 0 0 0\n");
        let err = reader(text).next_snapshot(|_| true, "xu", "yu").unwrap_err();
        assert!(err.to_string().contains("invalid atom type '4294967296'"), "{}", err);
    }

    #[test]
    fn read_snapshot_finds_timestep_in_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("a.dump");
        std::fs::write(&path, frame_text(40, &[(1, 1, 0.0, 0.0, 2.0, 3.0)])).unwrap();
        let snap = read_snapshot(&path, None, 40, "x", "y").unwrap();
        assert_eq!(snap.atoms()[0].pos.x, 2.0);
        assert!(read_snapshot(&path, None, 41, "x", "y").is_err());
    }
}

//! Directory-backed [`CalibrationStore`]: one JSON file per fiber record.
use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, Write},
};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::{
    amplifier::AmpContext,
    calibration::{CalibrationStore, FiberKey},
    fiber::Fiber,
    panacea_errors::PanaceaError,
};

#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: Utf8PathBuf,
}

impl DirectoryStore {
    /// Use `root` as the record directory; it is created on the first write.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        DirectoryStore { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn path(&self, key: &FiberKey) -> Utf8PathBuf {
        self.root.join(key.record_name())
    }
}

impl CalibrationStore for DirectoryStore {
    fn list(&self, ctx: &AmpContext) -> Result<Vec<String>, PanaceaError> {
        if !self.root.is_dir() {
            return Err(PanaceaError::FileNotFound(self.root.to_string()));
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if FiberKey::matches_context(name, ctx) {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    fn get(&self, key: &FiberKey) -> Result<Option<Fiber>, PanaceaError> {
        let path = self.path(key);
        if !path.is_file() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(&path)?);
        let mut fiber: Fiber = serde_json::from_reader(reader)?;
        fiber.evaluate_all();
        Ok(Some(fiber))
    }

    fn put(&mut self, key: &FiberKey, fiber: &Fiber) -> Result<(), PanaceaError> {
        fs::create_dir_all(&self.root)?;
        let path = self.path(key);
        let mut writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer(&mut writer, fiber)?;
        writer.flush()?;
        debug!(path = %path, "fiber record written");
        Ok(())
    }
}

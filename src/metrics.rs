use std::{
    fs::{self, File},
    io::Write,
    path::Path,
};

use anyhow::{anyhow, Context, Result};

const HEADER: &str = "Epoch,train_perplexities,valid_perplexities,test_perplexities";

/// Per-epoch perplexities of one model. Epochs are numbered from 1; the
/// single test perplexity is attached to the epoch it was measured after.
///
/// This is not the pandas layout of older runs, which numbered rows from 0
/// and put the test value on an extra row `N`. `load` reads both, since it
/// takes the epoch of the test value from its row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerplexityLog {
    pub train: Vec<f64>,
    pub valid: Vec<f64>,
    pub test: Option<(usize, f64)>,
}

impl PerplexityLog {
    pub fn push_epoch(&mut self, train: f64, valid: f64) {
        self.train.push(train);
        self.valid.push(valid);
    }

    pub fn epochs(&self) -> usize {
        self.train.len()
    }

    pub fn set_test(&mut self, epoch: usize, perplexity: f64) {
        self.test = Some((epoch, perplexity));
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut f = File::create(path)
            .with_context(|| format!("Cannot write perplexities to '{}'", path.display()))?;
        writeln!(f, "{HEADER}")?;
        let rows = self
            .epochs()
            .max(self.test.map(|(epoch, _)| epoch).unwrap_or(0));
        for epoch in 1..=rows {
            let cell = |values: &[f64]| {
                values
                    .get(epoch - 1)
                    .map(|v| v.to_string())
                    .unwrap_or_default()
            };
            let test = match self.test {
                Some((test_epoch, value)) if test_epoch == epoch => value.to_string(),
                _ => String::new(),
            };
            writeln!(
                f,
                "{epoch},{},{},{test}",
                cell(&self.train),
                cell(&self.valid)
            )?;
        }
        tracing::debug!("Saved perplexities to '{}'", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Cannot read perplexities from '{}'", path.display()))?;
        let mut lines = content.lines();
        if lines.next().map(str::trim) != Some(HEADER) {
            return Err(anyhow!("'{}' is not a perplexity log", path.display()));
        }

        let parse = |cell: &str, row: usize| -> Result<Option<f64>> {
            if cell.is_empty() {
                return Ok(None);
            }
            cell.parse::<f64>()
                .map(Some)
                .with_context(|| format!("bad value '{cell}' in row {row}"))
        };

        let mut log = PerplexityLog::default();
        for (row, line) in lines.filter(|l| !l.trim().is_empty()).enumerate() {
            let cells = line.split(',').collect::<Vec<_>>();
            if cells.len() != 4 {
                return Err(anyhow!("row {row} has {} columns", cells.len()));
            }
            let epoch = cells[0]
                .parse::<usize>()
                .with_context(|| format!("bad epoch '{}'", cells[0]))?;
            if let (Some(train), Some(valid)) = (parse(cells[1], row)?, parse(cells[2], row)?) {
                log.push_epoch(train, valid);
            }
            if let Some(test) = parse(cells[3], row)? {
                log.set_test(epoch, test);
            }
        }
        Ok(log)
    }
}

use std::{
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

/// On-disk layout of one experiment run:
///
/// ```text
/// <root>/<id>/experiment_<id>.log
/// <root>/<id>/config.json
/// <root>/<id>/models/<model_id>/checkpoint_<epoch>.safetensors
/// <root>/<id>/models/<model_id>/embeddings/embed_weights_epoch_<epoch>.safetensors
/// <root>/<id>/models/<model_id>/perplexities.csv
/// <root>/<id>/models/<model_id>/Model <model_id> Perplexity.png
/// ```
#[derive(Debug, Clone)]
pub struct ExperimentLayout {
    dir: PathBuf,
    id: usize,
}

/// What `prepare` did to the experiment directory.
/// Directories made along the way are listed in `dirs_created` so they can be
/// logged once logging is up.
#[derive(Debug)]
pub enum Preparation {
    Created { dirs_created: Vec<PathBuf> },
    /// The directory existed and was emptied. Entries that could not be removed
    /// are reported here and otherwise ignored.
    Cleared {
        failures: Vec<(PathBuf, io::Error)>,
        dirs_created: Vec<PathBuf>,
    },
    /// The directory existed and the user declined to overwrite it.
    Declined,
}

impl ExperimentLayout {
    pub fn new(root: impl AsRef<Path>, id: usize) -> Self {
        Self {
            dir: root.as_ref().join(id.to_string()),
            id,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_file(&self) -> PathBuf {
        self.dir.join(format!("experiment_{}.log", self.id))
    }

    pub fn config_file(&self) -> PathBuf {
        self.dir.join("config.json")
    }

    pub fn model_dir(&self, model_id: usize) -> PathBuf {
        self.dir.join("models").join(model_id.to_string())
    }

    pub fn embeddings_dir(&self, model_id: usize) -> PathBuf {
        self.model_dir(model_id).join("embeddings")
    }

    pub fn checkpoint(&self, model_id: usize, epoch: usize) -> PathBuf {
        self.model_dir(model_id)
            .join(format!("checkpoint_{epoch}.safetensors"))
    }

    pub fn embeddings(&self, model_id: usize, epoch: usize) -> PathBuf {
        self.embeddings_dir(model_id)
            .join(format!("embed_weights_epoch_{epoch}.safetensors"))
    }

    pub fn perplexities(&self, model_id: usize) -> PathBuf {
        self.model_dir(model_id).join("perplexities.csv")
    }

    pub fn plot(&self, model_id: usize) -> PathBuf {
        self.model_dir(model_id)
            .join(format!("Model {model_id} Perplexity.png"))
    }

    /// Creates the experiment directory, or asks before clearing an existing
    /// one. `assume_yes` skips the question. Model directories for both
    /// models exist afterwards unless the user declined.
    pub fn prepare(
        &self,
        assume_yes: bool,
        input: &mut impl BufRead,
        output: &mut impl Write,
    ) -> Result<Preparation> {
        let failures = if self.dir.exists() {
            let overwrite = assume_yes || confirm_overwrite(self.id, input, output)?;
            if !overwrite {
                return Ok(Preparation::Declined);
            }
            Some(clear_directory(&self.dir)?)
        } else {
            None
        };

        let mut dirs_created = Vec::new();
        for dir in [
            self.dir.clone(),
            self.embeddings_dir(1),
            self.embeddings_dir(2),
        ] {
            if create_folder_if_not_exists(&dir)? {
                dirs_created.push(dir);
            }
        }
        Ok(match failures {
            Some(failures) => Preparation::Cleared {
                failures,
                dirs_created,
            },
            None => Preparation::Created { dirs_created },
        })
    }
}

fn confirm_overwrite(
    id: usize,
    input: &mut impl BufRead,
    output: &mut impl Write,
) -> Result<bool> {
    writeln!(output, "Experiment {id} already exists")?;
    write!(output, "Do you wish to overwrite? (y/n): ")?;
    output.flush()?;

    let mut response = String::new();
    input.read_line(&mut response)?;
    Ok(response.trim().eq_ignore_ascii_case("y"))
}

/// Returns true when the folder had to be created.
pub fn create_folder_if_not_exists(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    fs::create_dir_all(path).with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(true)
}

/// Removes every entry below `dir`, keeping `dir` itself. Only failing to
/// list `dir` is an error; per-entry failures are returned.
pub fn clear_directory(dir: &Path) -> Result<Vec<(PathBuf, io::Error)>> {
    let mut failures = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;
    for entry in entries {
        let path = match entry {
            Ok(entry) => entry.path(),
            Err(e) => {
                failures.push((dir.to_path_buf(), e));
                continue;
            }
        };
        let removed = match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path),
            Ok(_) => fs::remove_file(&path),
            Err(e) => Err(e),
        };
        if let Err(e) = removed {
            failures.push((path, e));
        }
    }
    Ok(failures)
}

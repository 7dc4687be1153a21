use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use log::{info, warn};
use safetensors::{
    SafeTensors,
    tensor::{Dtype, TensorView},
};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, TrainErr},
    params::{ParamId, ParameterSet},
    shadow::ShadowTracker,
};

const INDEX_FILE: &str = "checkpoint.json";

/// The directory's record of which checkpoint is current.
#[derive(Debug, Default, Serialize, Deserialize)]
struct CheckpointIndex {
    latest: String,
    all: Vec<String>,
}

/// Persists and restores parameter state, tagged by step number.
///
/// Each checkpoint is one safetensors file holding every registry parameter
/// plus the shadow values under a `shadow/` prefix, next to a JSON index
/// naming the most recent file. A missing directory or index is the normal
/// cold-start state and reports as `Ok(false)`; anything unreadable once a
/// checkpoint is being restored is `CheckpointCorrupt`.
pub struct CheckpointManager {
    dir: PathBuf,
    model_name: String,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, model_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            model_name: model_name.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes the full parameter and shadow state for `step`.
    ///
    /// Creates the directory if absent. Saving the same step again
    /// overwrites the previous file.
    pub fn save(
        &self,
        step: u64,
        params: &ParameterSet,
        shadow: &ShadowTracker,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;

        let file_name = format!("{}-{step}.safetensors", self.model_name);
        let path = self.dir.join(&file_name);

        let mut tensors: Vec<(String, TensorView<'_>)> = Vec::with_capacity(params.len() * 2);
        for (_, p) in params.iter() {
            let view = TensorView::new(
                Dtype::F32,
                p.shape().to_vec(),
                bytemuck::cast_slice(p.values()),
            )
            .map_err(|e| TrainErr::CheckpointCorrupt {
                path: path.clone(),
                detail: e.to_string(),
            })?;
            tensors.push((p.name().to_string(), view));
        }
        for (id, values) in shadow.iter() {
            let p = params.get(id);
            let view = TensorView::new(
                Dtype::F32,
                p.shape().to_vec(),
                bytemuck::cast_slice(values),
            )
            .map_err(|e| TrainErr::CheckpointCorrupt {
                path: path.clone(),
                detail: e.to_string(),
            })?;
            tensors.push((format!("shadow/{}", p.name()), view));
        }

        let mut meta = HashMap::new();
        meta.insert("step".to_string(), step.to_string());

        let bytes = safetensors::serialize(tensors, &Some(meta)).map_err(|e| {
            TrainErr::CheckpointCorrupt {
                path: path.clone(),
                detail: e.to_string(),
            }
        })?;
        fs::write(&path, bytes)?;

        self.update_index(&file_name)?;
        info!(step = step; "saved checkpoint {file_name}");
        Ok(path)
    }

    fn update_index(&self, file_name: &str) -> Result<()> {
        let index_path = self.dir.join(INDEX_FILE);

        let mut index = fs::read_to_string(&index_path)
            .ok()
            .and_then(|text| serde_json::from_str::<CheckpointIndex>(&text).ok())
            .unwrap_or_default();

        index.latest = file_name.to_string();
        if !index.all.iter().any(|f| f == file_name) {
            index.all.push(file_name.to_string());
        }

        let text = serde_json::to_string_pretty(&index).map_err(|e| {
            TrainErr::CheckpointCorrupt {
                path: index_path.clone(),
                detail: e.to_string(),
            }
        })?;
        fs::write(&index_path, text)?;
        Ok(())
    }

    /// Restores parameter state from the directory.
    ///
    /// # Arguments
    /// * `checkpoint` - A specific file name; defaults to the index's most
    ///   recent entry.
    /// * `use_shadow` - Restore the shadow averages into the live
    ///   parameters instead of the raw trained values.
    /// * `shadow` - Tracker to reload alongside a raw restore.
    ///
    /// # Returns
    /// `Ok(false)` when there is nothing to restore (no directory, no
    /// index, no entry), the normal cold-start state.
    pub fn load(
        &self,
        checkpoint: Option<&str>,
        use_shadow: bool,
        params: &mut ParameterSet,
        shadow: Option<&mut ShadowTracker>,
    ) -> Result<bool> {
        if !self.dir.exists() {
            warn!("checkpoint directory {} does not exist", self.dir.display());
            return Ok(false);
        }

        let file_name = match checkpoint {
            Some(name) => name.to_string(),
            None => {
                let index_path = self.dir.join(INDEX_FILE);
                if !index_path.exists() {
                    return Ok(false);
                }
                let text = fs::read_to_string(&index_path)?;
                let index: CheckpointIndex =
                    serde_json::from_str(&text).map_err(|e| TrainErr::CheckpointCorrupt {
                        path: index_path.clone(),
                        detail: e.to_string(),
                    })?;
                if index.latest.is_empty() {
                    return Ok(false);
                }
                index.latest
            }
        };

        let path = self.dir.join(&file_name);
        let bytes = fs::read(&path).map_err(|e| TrainErr::CheckpointCorrupt {
            path: path.clone(),
            detail: e.to_string(),
        })?;
        let tensors =
            SafeTensors::deserialize(&bytes).map_err(|e| TrainErr::CheckpointCorrupt {
                path: path.clone(),
                detail: e.to_string(),
            })?;

        let ids: Vec<ParamId> = params.iter().map(|(id, _)| id).collect();
        for id in ids {
            let (name, trainable) = {
                let p = params.get(id);
                (p.name().to_string(), p.trainable())
            };
            let key = if use_shadow && trainable {
                format!("shadow/{name}")
            } else {
                name
            };

            let values = self.read_tensor(&tensors, &key, &path, params.get(id).shape())?;
            params.get_mut(id).values_mut().copy_from_slice(&values);
        }

        if !use_shadow {
            if let Some(tracker) = shadow {
                for id in params.iter().filter(|(_, p)| p.trainable()).map(|(id, _)| id) {
                    let p = params.get(id);
                    let key = format!("shadow/{}", p.name());
                    let values = self.read_tensor(&tensors, &key, &path, p.shape())?;
                    if !tracker.restore(id, &values) {
                        return Err(TrainErr::CheckpointCorrupt {
                            path: path.clone(),
                            detail: format!("shadow slot mismatch for {key}"),
                        });
                    }
                }
            }
        }

        info!("restored checkpoint {file_name}");
        Ok(true)
    }

    fn read_tensor(
        &self,
        tensors: &SafeTensors<'_>,
        key: &str,
        path: &Path,
        shape: &[usize],
    ) -> Result<Vec<f32>> {
        let view = tensors.tensor(key).map_err(|_| TrainErr::CheckpointCorrupt {
            path: path.to_path_buf(),
            detail: format!("missing tensor {key}"),
        })?;

        if view.dtype() != Dtype::F32 || view.shape() != shape {
            return Err(TrainErr::CheckpointCorrupt {
                path: path.to_path_buf(),
                detail: format!("tensor {key} doesn't match the live parameter"),
            });
        }

        let data = view.data();
        let values = data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(values)
    }
}

//! Per-network checkpoint files.
//!
//! A model keeps several logical networks in one `VarStore`, each under its
//! own top-level path (`g_a`, `d_a_full`, ...). Every network is written to
//! `{tag}_net_{name}.ot` with names relative to that path, so a file can be
//! loaded into any store holding a network of the same shape.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, warn};
use tch::{nn, Tensor};

pub fn network_file_name(tag: &str, name: &str) -> String {
    format!("{}_net_{}.ot", tag, name)
}

fn named_variables(vs: &nn::VarStore, name: &str) -> Vec<(String, Tensor)> {
    let prefix = format!("{}.", name);
    let mut variables: Vec<(String, Tensor)> = vs
        .variables()
        .into_iter()
        .filter_map(|(key, tensor)| {
            key.strip_prefix(&prefix)
                .map(|local| (local.to_string(), tensor))
        })
        .collect();
    variables.sort_by(|a, b| a.0.cmp(&b.0));
    variables
}

/// Writes each named network of `vs` to `dir`, returning the written paths.
pub fn save_networks(
    vs: &nn::VarStore,
    names: &[&str],
    dir: &Path,
    tag: &str,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating checkpoint dir {}", dir.display()))?;

    let mut written = Vec::with_capacity(names.len());
    for name in names {
        let variables = named_variables(vs, name);
        let path = dir.join(network_file_name(tag, name));
        Tensor::save_multi(&variables, &path)
            .with_context(|| format!("saving network {} to {}", name, path.display()))?;
        debug!("saved {} tensors of {} to {}", variables.len(), name, path.display());
        written.push(path);
    }
    Ok(written)
}

/// Copies the tensors of a network file into the `name` network of `vs`.
///
/// Returns the number of tensors restored. Stored tensors without a matching
/// variable are skipped with a warning.
pub fn load_network(vs: &nn::VarStore, name: &str, path: &Path) -> Result<usize> {
    let stored = Tensor::load_multi_with_device(path, vs.device())
        .with_context(|| format!("loading network {} from {}", name, path.display()))?;
    let variables = vs.variables();

    let mut restored = 0;
    tch::no_grad(|| -> Result<()> {
        for (local, value) in stored.iter() {
            let key = format!("{}.{}", name, local);
            match variables.get(&key) {
                Some(variable) => {
                    variable
                        .shallow_clone()
                        .f_copy_(value)
                        .with_context(|| format!("restoring {}", key))?;
                    restored += 1;
                }
                None => warn!("{}: no variable {} in the model", path.display(), key),
            }
        }
        Ok(())
    })?;
    Ok(restored)
}

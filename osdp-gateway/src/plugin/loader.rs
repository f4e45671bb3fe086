//
// Copyright (c) 2023-2024 The osdp-gateway contributors
//
// SPDX-License-Identifier: Apache-2.0

//! Plugin artifact scanning and loading.

use std::path::{Path, PathBuf};

use libloading::Library;

use crate::plugin::{PluginDeclaration, PLUGIN_DECLARATION_SYMBOL};
use crate::GatewayError;

type Result<T> = core::result::Result<T, GatewayError>;

#[cfg(target_os = "windows")]
const ARTIFACT_EXTENSION: &str = "dll";
#[cfg(target_os = "macos")]
const ARTIFACT_EXTENSION: &str = "dylib";
#[cfg(all(unix, not(target_os = "macos")))]
const ARTIFACT_EXTENSION: &str = "so";

/// Loadable artifacts in a plugin directory, sorted by file name so the
/// scan order is stable across runs.
pub fn scan(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        GatewayError::Plugin(format!("cannot read plugin directory {}: {e}", dir.display()))
    })?;
    let mut artifacts: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .map(|ext| ext == ARTIFACT_EXTENSION)
                .unwrap_or(false)
        })
        .collect();
    artifacts.sort();
    Ok(artifacts)
}

/// Load an artifact and read its registration record.
///
/// # Safety
///
/// Loading a library runs its initializers, and the declaration's
/// constructor pointers are trusted to be what they claim. Only load
/// artifacts from the operator-configured plugin directory.
pub unsafe fn load(path: &Path) -> Result<(Library, PluginDeclaration)> {
    let library = Library::new(path).map_err(|e| {
        GatewayError::Plugin(format!("cannot load {}: {e}", path.display()))
    })?;
    let declaration = library
        .get::<*mut PluginDeclaration>(PLUGIN_DECLARATION_SYMBOL)
        .map_err(|e| {
            GatewayError::Plugin(format!(
                "{} does not export a plugin declaration: {e}",
                path.display()
            ))
        })?
        .read();
    Ok((library, declaration))
}

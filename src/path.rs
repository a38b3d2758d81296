// Copyright (c) 2022, Matteo Bernacchia <dev@kikijiki.com>. All rights reserved.
// This project is dual licensed under the Apache License 2.0 and the MIT license.
// See the LICENSE files in the project root for details.

use std::collections::HashMap;

use tracing::trace;

use crate::{
    api::ROOT_RECORD,
    device::BlockDevice,
    errors::{NtfsError, NtfsResult},
    file::NtfsFile,
    index::find_in_directory,
    mft::Mft,
};

/// Deepest parent chain followed when rebuilding a full path.
pub const MAX_PATH_DEPTH: usize = 1024;
/// How many `%VAR%` expansions may be chained for one path.
pub const MAX_EXPANSION_DEPTH: usize = 8;

/// Record number to (parent record number, name), filled while rebuilding
/// paths. Meant to live for one operation only.
pub type PathCache = HashMap<u64, (u64, String)>;

type VariableLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolves `X:\dir\file` style paths against the directory indexes of a
/// volume.
pub struct PathResolver {
    lookup: VariableLookup,
}

impl Default for PathResolver {
    fn default() -> Self {
        PathResolver {
            lookup: Box::new(|name| std::env::var(name).ok()),
        }
    }
}

impl PathResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the environment as the source of `%VAR%` values.
    pub fn with_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        PathResolver {
            lookup: Box::new(lookup),
        }
    }

    pub fn resolve<D: BlockDevice>(&self, mft: &mut Mft<D>, path: &str) -> NtfsResult<NtfsFile> {
        let components = self.expand(path)?;
        let (volume_token, rest) = components
            .split_first()
            .ok_or_else(|| NtfsError::BadPath(path.to_string()))?;

        if !mft.volume.is_volume_letter(volume_token) {
            return Err(NtfsError::BadPath(format!(
                "'{}' does not name this volume",
                volume_token
            )));
        }

        let mut current = mft.read_record(ROOT_RECORD)?;
        for (position, component) in rest.iter().enumerate() {
            if !current.is_directory() {
                return Err(NtfsError::BadPath(format!(
                    "'{}' is not a directory",
                    rest[..position].join("\\")
                )));
            }
            trace!("Looking up '{}' in record {}", component, current.number());
            current = find_in_directory(mft, &current, component)?;
        }

        Ok(current)
    }

    /// Splits `path` and expands a leading `%VAR%` until the first component
    /// is a volume token.
    pub fn expand(&self, path: &str) -> NtfsResult<Vec<String>> {
        let mut components = split(path)?;

        for _ in 0..=MAX_EXPANSION_DEPTH {
            let Some(variable) = components
                .first()
                .and_then(|first| first.strip_prefix('%'))
                .and_then(|first| first.strip_suffix('%'))
            else {
                return Ok(components);
            };

            let value = (self.lookup)(variable).ok_or_else(|| {
                NtfsError::BadPath(format!("environment variable '{}' is not set", variable))
            })?;
            let mut expanded = split(&value)?;
            expanded.extend(components.drain(1..));
            components = expanded;
        }

        Err(NtfsError::BadPath(format!(
            "'{}' expands more than {} times",
            path, MAX_EXPANSION_DEPTH
        )))
    }
}

/// Splits on `\`, dropping empty components.
pub fn split(path: &str) -> NtfsResult<Vec<String>> {
    let components: Vec<String> = path
        .split('\\')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();

    if components.is_empty() {
        return Err(NtfsError::BadPath(format!("'{}' has no components", path)));
    }
    Ok(components)
}

/// Rebuilds the full path of `file` by walking its parent chain up to the
/// root directory.
pub fn full_path<D: BlockDevice>(
    mft: &mut Mft<D>,
    file: &NtfsFile,
    cache: &mut PathCache,
) -> NtfsResult<String> {
    let prefix = mft.volume.prefix();
    if file.number() == ROOT_RECORD {
        return Ok(prefix);
    }

    let mut components = vec![file.friendly_name()?];
    let mut parent = file.parent_reference()?.record_number();
    cache.insert(file.number(), (parent, components[0].clone()));

    while parent != ROOT_RECORD {
        if components.len() > MAX_PATH_DEPTH {
            return Err(NtfsError::BadPath(format!(
                "parent chain of record {} is deeper than {}",
                file.number(),
                MAX_PATH_DEPTH
            )));
        }

        let (next, name) = match cache.get(&parent) {
            Some(entry) => entry.clone(),
            None => {
                let directory = mft.read_record(parent)?;
                let entry = (
                    directory.parent_reference()?.record_number(),
                    directory.friendly_name()?,
                );
                cache.insert(parent, entry.clone());
                entry
            }
        };

        components.push(name);
        parent = next;
    }

    components.reverse();
    Ok(prefix + &components.join("\\"))
}

// SPDX-License-Identifier: Apache-2.0

use crate::init::args::TailerArgs;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::path::Path;
use tower::BoxError;
use tracing::error;

pub const ENV_PREFIX: &str = "LOGTAIL_";

/// Load tailer options from a TOML file, with `LOGTAIL_*` environment
/// variables taking precedence over the file.
pub fn load_file_config(path: &Path) -> Result<TailerArgs, BoxError> {
    if !path.exists() {
        return Err(format!("config file not found: {}", path.display()).into());
    }

    let figment = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]));

    match figment.extract::<TailerArgs>() {
        Ok(mut args) => {
            args.config = Some(path.to_path_buf());
            Ok(args)
        }
        Err(e) => {
            error!(path = ?path, error = %e, "Failed to parse config file");
            Err(e.into())
        }
    }
}

/// Arguments to run with: the command line, or the config file it names.
pub fn resolve_args(cli: TailerArgs) -> Result<TailerArgs, BoxError> {
    match &cli.config {
        Some(path) => load_file_config(path),
        None => Ok(cli),
    }
}

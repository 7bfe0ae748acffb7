use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Error, ErrorDetails};
use crate::{Args, OutputFormat};

/// Whether metrics are computed or only model outputs are recorded.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[clap(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
    #[default]
    Normal,
    PredictOnly,
}

/// How ranks agree that every rank has finished before the run ends.
#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[clap(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FinalizationMode {
    /// A process-group barrier.
    #[default]
    Collective,
    /// Per-rank marker files in the output directory, polled until all are present.
    MarkerFiles,
}

pub const DEFAULT_BOOTSTRAP_ITERS: usize = 100_000;
pub const DEFAULT_RANDOM_SEED: u64 = 0;
pub const DEFAULT_FEWSHOT_SEED: u64 = 1234;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvaluationOptions {
    /// Document count per task, or a fraction of the documents when below 1.0.
    pub limit: Option<f64>,
    /// Bootstrap resamples for standard errors; 0 disables standard errors.
    pub bootstrap_iters: usize,
    pub log_samples: bool,
    pub mode: EvaluationMode,
    pub num_fewshot: Option<usize>,
    /// Generation overrides as `key=value` pairs separated by commas.
    pub gen_kwargs: Option<String>,
    pub random_seed: Option<u64>,
    pub fewshot_random_seed: Option<u64>,
    pub model_args: Option<String>,
    /// Revision of the evaluation code, copied into the results.
    pub git_hash: Option<String>,
    pub output_path: Option<PathBuf>,
    pub finalization: FinalizationMode,
    pub format: OutputFormat,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        Self {
            limit: None,
            bootstrap_iters: DEFAULT_BOOTSTRAP_ITERS,
            log_samples: true,
            mode: EvaluationMode::default(),
            num_fewshot: None,
            gen_kwargs: None,
            random_seed: Some(DEFAULT_RANDOM_SEED),
            fewshot_random_seed: Some(DEFAULT_FEWSHOT_SEED),
            model_args: None,
            git_hash: None,
            output_path: None,
            finalization: FinalizationMode::default(),
            format: OutputFormat::default(),
        }
    }
}

impl EvaluationOptions {
    pub fn from_toml_file(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorDetails::FileIo {
                path: path.display().to_string(),
                message: e.to_string(),
            })
        })?;
        toml::from_str(&contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("failed to parse `{}`: {e}", path.display()),
            })
        })
    }

    /// Loads the config file named by `args` (if any) and applies the command-line overrides.
    pub fn from_args(args: &Args) -> Result<Self, Error> {
        let mut options = match &args.config_file {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        if let Some(limit) = args.limit {
            options.limit = Some(limit);
        }
        if let Some(bootstrap_iters) = args.bootstrap_iters {
            options.bootstrap_iters = bootstrap_iters;
        }
        if let Some(log_samples) = args.log_samples {
            options.log_samples = log_samples;
        }
        if args.predict_only {
            options.mode = EvaluationMode::PredictOnly;
        }
        if let Some(num_fewshot) = args.num_fewshot {
            options.num_fewshot = Some(num_fewshot);
        }
        if let Some(gen_kwargs) = &args.gen_kwargs {
            options.gen_kwargs = Some(gen_kwargs.clone());
        }
        if let Some(seed) = args.seed {
            options.random_seed = Some(seed);
        }
        if let Some(seed) = args.fewshot_seed {
            options.fewshot_random_seed = Some(seed);
        }
        if let Some(model_args) = &args.model_args {
            options.model_args = Some(model_args.clone());
        }
        if let Some(git_hash) = &args.git_hash {
            options.git_hash = Some(git_hash.clone());
        }
        if let Some(output_path) = &args.output_path {
            options.output_path = Some(output_path.clone());
        }
        if let Some(finalization) = args.finalization {
            options.finalization = finalization;
        }
        if let Some(format) = &args.format {
            options.format = format.clone();
        }
        debug!(?options, "Resolved evaluation options");
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if let Some(limit) = self.limit
            && (!limit.is_finite() || limit <= 0.0)
        {
            return Err(Error::new(ErrorDetails::Config {
                message: format!("limit must be a positive number, got {limit}"),
            }));
        }
        if self.finalization == FinalizationMode::MarkerFiles && self.output_path.is_none() {
            return Err(Error::new(ErrorDetails::Config {
                message: "marker file finalization requires an output path".to_string(),
            }));
        }
        self.parsed_gen_kwargs()?;
        Ok(())
    }

    pub fn parsed_gen_kwargs(&self) -> Result<Option<Map<String, Value>>, Error> {
        self.gen_kwargs
            .as_deref()
            .map(parse_gen_kwargs)
            .transpose()
    }
}

/// Parses `key=value,key2=value2` into typed JSON values: booleans, integers and floats are
/// recognized, anything else stays a string.
pub fn parse_gen_kwargs(s: &str) -> Result<Map<String, Value>, Error> {
    let mut kwargs = Map::new();
    for pair in s.split(',').map(str::trim).filter(|pair| !pair.is_empty()) {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(Error::new(ErrorDetails::Config {
                message: format!("invalid gen_kwargs entry `{pair}`; expected key=value"),
            }));
        };
        kwargs.insert(key.trim().to_string(), parse_arg_value(value.trim()));
    }
    Ok(kwargs)
}

fn parse_arg_value(value: &str) -> Value {
    if value.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if value.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if let Ok(int) = value.parse::<i64>() {
        return Value::from(int);
    }
    if let Ok(float) = value.parse::<f64>()
        && let Some(number) = serde_json::Number::from_f64(float)
    {
        return Value::Number(number);
    }
    Value::String(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serde_json::json;

    #[test]
    fn test_parse_gen_kwargs_types() {
        let kwargs = parse_gen_kwargs("temperature=0, top_p=0.9,do_sample=False,until=###").unwrap();
        assert_eq!(
            Value::Object(kwargs),
            json!({"temperature": 0, "top_p": 0.9, "do_sample": false, "until": "###"})
        );
        assert!(parse_gen_kwargs("temperature").is_err());
        assert!(parse_gen_kwargs("").unwrap().is_empty());
    }

    #[test]
    fn test_defaults() {
        let options = EvaluationOptions::default();
        assert_eq!(options.bootstrap_iters, 100_000);
        assert!(options.log_samples);
        assert_eq!(options.fewshot_random_seed, Some(1234));
        assert_eq!(options.finalization, FinalizationMode::Collective);
    }

    #[test]
    fn test_toml_file_with_cli_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eval.toml");
        std::fs::write(
            &path,
            "limit = 8.0\nbootstrap_iters = 10\nmode = \"predict_only\"\nfinalization = \"marker_files\"\noutput_path = \"/tmp/out\"\n",
        )
        .unwrap();
        let args = Args::try_parse_from([
            "lmm-evaluations",
            "--config-file",
            path.to_str().unwrap(),
            "--bootstrap-iters",
            "0",
            "--gen-kwargs",
            "max_new_tokens=32",
            "--git-hash",
            "4f2a9c1",
        ])
        .unwrap();
        let options = EvaluationOptions::from_args(&args).unwrap();
        assert_eq!(options.limit, Some(8.0));
        assert_eq!(options.bootstrap_iters, 0);
        assert_eq!(options.mode, EvaluationMode::PredictOnly);
        assert_eq!(options.finalization, FinalizationMode::MarkerFiles);
        assert_eq!(options.git_hash.as_deref(), Some("4f2a9c1"));
        assert_eq!(
            options.parsed_gen_kwargs().unwrap(),
            Some(Map::from_iter([("max_new_tokens".to_string(), json!(32))]))
        );
    }

    #[test]
    fn test_unknown_toml_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eval.toml");
        std::fs::write(&path, "limt = 3\n").unwrap();
        assert!(EvaluationOptions::from_toml_file(&path).is_err());
    }

    #[test]
    fn test_marker_files_need_output_path() {
        let options = EvaluationOptions {
            finalization: FinalizationMode::MarkerFiles,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_non_positive_limit_is_rejected() {
        let options = EvaluationOptions {
            limit: Some(0.0),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}

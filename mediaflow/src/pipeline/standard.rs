//! The fixed five-stage ELT chain.

use super::{MaterializationSpec, Pipeline, PipelineBuilder, StageSpec};
use crate::config::{Config, StageConfig};
use crate::errors::PipelineValidationError;
use crate::stages::{CommandSpec, CommandStage};
use crate::warehouse::{DETECTION_RESULTS_TABLE, RAW_RECORDS_TABLE};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Stage that runs the extraction collaborator.
pub const EXTRACT: &str = "extract";
/// Stage that upserts record batches into the warehouse.
pub const LOAD_RAW: &str = "load_raw";
/// Stage that runs the transformation collaborator.
pub const TRANSFORM: &str = "transform";
/// Stage that detects and classifies attachment images.
pub const ENRICH: &str = "enrich";
/// Stage that swaps the detection snapshot into the warehouse.
pub const LOAD_ENRICHMENT: &str = "load_enrichment";

impl PipelineBuilder {
    /// Assembles the standard chain from configuration.
    ///
    /// Stages without a configured command run the matching subcommand of
    /// `self_exe` with `--config <config_path>`.
    ///
    /// # Errors
    ///
    /// Returns an error if a stage without a built-in body has no command.
    pub fn standard(
        config: &Config,
        self_exe: &Path,
        config_path: &Path,
    ) -> Result<Self, PipelineValidationError> {
        let stages = &config.pipeline.stages;
        let raw_dir = config.raw_dir().display().to_string();
        let snapshot = config.snapshot_path().display().to_string();
        let builtin = |subcommand: &str| {
            CommandSpec::new(self_exe.display().to_string())
                .args(["--config".to_string(), config_path.display().to_string()])
                .arg(subcommand)
        };

        let chain = [
            (
                EXTRACT,
                &stages.extract,
                None,
                MaterializationSpec::new("record_batches", "Raw record batches in the data lake")
                    .with_metadata("location", raw_dir.clone()),
            ),
            (
                LOAD_RAW,
                &stages.load_raw,
                Some(builtin("load-raw")),
                MaterializationSpec::new(RAW_RECORDS_TABLE, "Records merged into the raw table")
                    .with_metadata("table", RAW_RECORDS_TABLE)
                    .with_metadata("source", raw_dir),
            ),
            (
                TRANSFORM,
                &stages.transform,
                None,
                MaterializationSpec::new("warehouse_marts", "Transformation models built"),
            ),
            (
                ENRICH,
                &stages.enrich,
                Some(builtin("enrich")),
                MaterializationSpec::new("detection_snapshot", "Detections for every attachment")
                    .with_metadata("location", snapshot.clone()),
            ),
            (
                LOAD_ENRICHMENT,
                &stages.load_enrichment,
                Some(builtin("load-detections")),
                MaterializationSpec::new(
                    DETECTION_RESULTS_TABLE,
                    "Detection snapshot loaded into the warehouse",
                )
                .with_metadata("table", DETECTION_RESULTS_TABLE)
                .with_metadata("source", snapshot),
            ),
        ];

        let mut builder = Self::new(config.pipeline.name.clone())
            .with_tail_limit(config.pipeline.tail_limit);
        for (name, stage_config, builtin_command, materialization) in chain {
            let stage = command_stage(config, name, stage_config, builtin_command)?;
            builder = builder.stage(
                StageSpec::new(name, Arc::new(stage))
                    .with_retry(stage_config.retry.clone())
                    .with_materialization(materialization),
            )?;
        }
        Ok(builder)
    }
}

impl Pipeline {
    /// Builds the standard chain with no event sink.
    ///
    /// # Errors
    ///
    /// See [`PipelineBuilder::standard`].
    pub fn standard(
        config: &Config,
        self_exe: &Path,
        config_path: &Path,
    ) -> Result<Self, PipelineValidationError> {
        PipelineBuilder::standard(config, self_exe, config_path)?.build()
    }
}

fn command_stage(
    config: &Config,
    name: &str,
    stage_config: &StageConfig,
    builtin: Option<CommandSpec>,
) -> Result<CommandStage, PipelineValidationError> {
    let mut command = CommandSpec::from_argv(&stage_config.command)
        .or(builtin)
        .ok_or_else(|| {
            PipelineValidationError::new(format!("Stage '{name}' has no command configured"))
                .with_stages(vec![name.to_string()])
        })?;
    command.working_dir = Some(
        stage_config
            .working_dir
            .as_deref()
            .map_or_else(|| config.base_dir.clone(), |dir| config.resolve(dir)),
    );

    let mut stage = CommandStage::new(name, command).with_tail_limit(config.pipeline.tail_limit);
    if let Some(secs) = stage_config.timeout_secs {
        stage = stage.with_timeout(Duration::from_secs(secs));
    }
    for aux in &stage_config.auxiliary {
        let mut aux = aux.clone();
        aux.command.working_dir = Some(
            aux.command
                .working_dir
                .as_deref()
                .map_or_else(|| config.base_dir.clone(), |dir| config.resolve(dir)),
        );
        stage = stage.with_auxiliary(aux);
    }
    Ok(stage)
}

use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use chrono::{NaiveDate, Utc};
use serde::Serialize;

use crate::assemble::{self, MasterDataset};
use crate::backfill;
use crate::config::{FeedShape, ResolvedConfig};
use crate::domain::DateRange;
use crate::error::PipelineError;
use crate::export;
use crate::feeds::FeedClient;
use crate::forecast::{FallbackNotice, ForecastEngine, Forecaster};
use crate::ingest::{self, RawSources};
use crate::reference::ReferenceTable;
use crate::resolve::{ResolutionWarning, Resolver};
use crate::store::Store;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone)]
pub struct Context {
    pub raw_sources: RawSources,
    pub reference: ReferenceTable,
}

#[derive(Debug, Clone)]
pub struct BuildResult {
    pub date_range: DateRange,
    pub dataset: MasterDataset,
    pub fallbacks: Vec<FallbackNotice>,
    pub warnings: Vec<ResolutionWarning>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedSummary {
    pub name: String,
    pub source: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputPaths {
    pub master: String,
    pub entities: String,
    pub report: String,
    pub archives: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub generated_at: String,
    pub dry_run: bool,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub observed_days: usize,
    pub horizon: usize,
    pub entities: usize,
    pub rows: usize,
    pub feeds: Vec<FeedSummary>,
    pub fallbacks: Vec<FallbackNotice>,
    pub warnings: Vec<ResolutionWarning>,
    pub outputs: OutputPaths,
}

#[derive(Clone)]
pub struct App<F: FeedClient, M: Forecaster> {
    store: Store,
    feeds: F,
    model: M,
}

impl<F: FeedClient, M: Forecaster> App<F, M> {
    pub fn new(store: Store, feeds: F, model: M) -> Self {
        Self {
            store,
            feeds,
            model,
        }
    }


    pub fn prepare(
        &self,
        config: &ResolvedConfig,
        sink: &dyn ProgressSink,
    ) -> Result<Context, PipelineError> {
        let started = Instant::now();
        sink.event(ProgressEvent {
            message: format!("phase=Ingest; {} feeds", config.feeds.len()),
            elapsed: None,
        });
        let raw_sources = ingest::ingest_feeds(&self.feeds, &config.feeds)?;
        sink.event(ProgressEvent {
            message: format!("phase=Ingest; {} rows", raw_sources.row_count()),
            elapsed: Some(started.elapsed()),
        });

        let started = Instant::now();
        sink.event(ProgressEvent {
            message: "phase=Reference; loading reference tables".to_string(),
            elapsed: None,
        });
        let reference = ReferenceTable::load(&self.feeds, &config.reference)?;
        sink.event(ProgressEvent {
            message: "phase=Reference; done".to_string(),
            elapsed: Some(started.elapsed()),
        });

        Ok(Context {
            raw_sources,
            reference,
        })
    }

    pub fn build(
        &self,
        context: &Context,
        config: &ResolvedConfig,
        sink: &dyn ProgressSink,
    ) -> Result<BuildResult, PipelineError> {
        let started = Instant::now();
        sink.event(ProgressEvent {
            message: "phase=Resolve; merging sources".to_string(),
            elapsed: None,
        });
        let resolver = Resolver {
            reference: &context.reference,
            tie_break: &config.tie_break,
            manual: &config.manual,
            worldwide: config.worldwide,
        };
        let resolution = resolver.resolve(&context.raw_sources)?;
        sink.event(ProgressEvent {
            message: format!("phase=Resolve; {} entities", resolution.entities.len()),
            elapsed: Some(started.elapsed()),
        });

        let started = Instant::now();
        let date_range = backfill::calendar(&resolution, config.calendar_start)?;
        sink.event(ProgressEvent {
            message: format!("phase=Backfill; {} days", date_range.num_days()),
            elapsed: None,
        });
        let series = backfill::backfill_all(&resolution, &date_range)?;
        sink.event(ProgressEvent {
            message: "phase=Backfill; done".to_string(),
            elapsed: Some(started.elapsed()),
        });

        let started = Instant::now();
        sink.event(ProgressEvent {
            message: format!(
                "phase=Forecast; {} entities, horizon {}",
                series.len(),
                config.horizon
            ),
            elapsed: None,
        });
        let engine = ForecastEngine::new(&self.model, config.horizon, config.workers);
        let outcome = engine.run(&series)?;
        sink.event(ProgressEvent {
            message: format!("phase=Forecast; {} fallbacks", outcome.fallbacks.len()),
            elapsed: Some(started.elapsed()),
        });

        let started = Instant::now();
        let dataset = assemble::assemble(
            &series,
            &outcome.forecasts,
            resolution.worldwide.as_ref(),
            &config.display,
        )?;
        sink.event(ProgressEvent {
            message: format!("phase=Assemble; {} rows", dataset.records.len()),
            elapsed: Some(started.elapsed()),
        });

        Ok(BuildResult {
            date_range,
            dataset,
            fallbacks: outcome.fallbacks,
            warnings: resolution.warnings,
        })
    }

    pub fn run(
        &self,
        config: &ResolvedConfig,
        options: RunOptions,
        sink: &dyn ProgressSink,
    ) -> Result<RunReport, PipelineError> {
        let context = self.prepare(config, sink)?;
        let built = self.build(&context, config, sink)?;

        sink.event(ProgressEvent {
            message: "phase=Encode; parquet".to_string(),
            elapsed: None,
        });
        let master = export::encode_master(&built.dataset.records)?;
        let entities = export::encode_entities(&built.dataset.labels)?;
        let archives = if config.output.archive {
            self.encode_archives(config, &context)?
        } else {
            Vec::new()
        };

        let report = RunReport {
            generated_at: Utc::now().to_rfc3339(),
            dry_run: options.dry_run,
            start: built.date_range.start,
            end: built.date_range.end,
            observed_days: built.date_range.num_days(),
            horizon: config.horizon,
            entities: built.dataset.entity_count(),
            rows: built.dataset.records.len(),
            feeds: context
                .raw_sources
                .tables
                .values()
                .map(|table| FeedSummary {
                    name: table.feed.clone(),
                    source: table.source.to_string(),
                    rows: table.rows.len(),
                })
                .collect(),
            fallbacks: built.fallbacks,
            warnings: built.warnings,
            outputs: OutputPaths {
                master: self.store.master_path().to_string(),
                entities: self.store.entities_path().to_string(),
                report: self.store.report_path().to_string(),
                archives: archives.iter().map(|(path, _)| path.to_string()).collect(),
            },
        };

        if options.dry_run {
            sink.event(ProgressEvent {
                message: "phase=Store; dry run, nothing written".to_string(),
                elapsed: None,
            });
            return Ok(report);
        }

        let report_bytes = serde_json::to_vec_pretty(&report)
            .map_err(|err| PipelineError::Encode(err.to_string()))?;
        let mut files = vec![
            (self.store.master_path(), master),
            (self.store.entities_path(), entities),
            (self.store.report_path(), report_bytes),
        ];
        files.extend(archives);

        let started = Instant::now();
        sink.event(ProgressEvent {
            message: format!("phase=Store; writing {} files", files.len()),
            elapsed: None,
        });
        Store::commit(files)?;
        sink.event(ProgressEvent {
            message: "phase=Store; done".to_string(),
            elapsed: Some(started.elapsed()),
        });
        Ok(report)
    }

    fn encode_archives(
        &self,
        config: &ResolvedConfig,
        context: &Context,
    ) -> Result<Vec<(Utf8PathBuf, Vec<u8>)>, PipelineError> {
        let today = Utc::now().date_naive();
        config
            .feeds
            .iter()
            .filter(|feed| feed.shape == FeedShape::CurrentJson)
            .filter_map(|feed| context.raw_sources.tables.get(&feed.name))
            .map(|table| {
                let bytes = ingest::encode_archive(&table.rows)?;
                Ok((self.store.archive_path(&table.feed, today), bytes))
            })
            .collect()
    }
}

use std::sync::Arc;

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::Connection;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Settings;
use crate::db::{self, BlockRecord, ProblemRecord};
use crate::error::{FetchError, PageError};
use crate::fetch::Fetch;
use crate::parser::image::{BlockType, ImageResolver, ReferenceTemplate};
use crate::parser::page::ProblemPage;
use crate::parser::{self, ExtractedProblem};
use crate::source;

/// Load stats returned after completion.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadStats {
    pub total: usize,
    pub ok: usize,
    pub skipped: usize,
    pub images: usize,
    pub image_failures: usize,
}

/// What a worker sends back for one problem id.
enum Outcome {
    Loaded {
        record: ProblemRecord,
        images: usize,
        skipped_images: usize,
    },
    Skipped {
        problem_id: String,
        reason: String,
    },
}

/// Shared, read-only state handed to every worker.
pub struct LoadContext<F> {
    pub subject_code: String,
    pub exam_type: String,
    pub fetcher: Arc<F>,
    pub resolver: ImageResolver<Arc<F>>,
    pub template: ReferenceTemplate,
}

impl<F: Fetch> LoadContext<F> {
    pub fn new(settings: &Settings, subject_code: &str, fetcher: F) -> Self {
        let fetcher = Arc::new(fetcher);
        LoadContext {
            subject_code: subject_code.to_string(),
            exam_type: settings.exam_type.clone(),
            resolver: ImageResolver::new(
                Arc::clone(&fetcher),
                settings.images_dir.clone(),
                settings.image_deadline(),
            ),
            fetcher,
            template: ReferenceTemplate::new(settings.image_url_base.clone()),
        }
    }
}

/// Load problems concurrently, saving each result to DB as it arrives.
///
/// Each problem holds one worker slot from fetch through extraction; the
/// fetcher applies its own per-request limit underneath.
pub async fn load_problems<F>(
    conn: &Connection,
    ctx: Arc<LoadContext<F>>,
    problem_ids: Vec<String>,
    concurrency: usize,
) -> Result<LoadStats>
where
    F: Fetch + 'static,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let total = problem_ids.len();

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")?
            .progress_chars("=> "),
    );

    // Channel: workers send results, main loop saves to DB
    let (tx, mut rx) = mpsc::channel::<Outcome>(concurrency.max(1) * 2);

    for problem_id in problem_ids {
        let ctx = Arc::clone(&ctx);
        let sem = Arc::clone(&semaphore);
        let tx = tx.clone();

        tokio::spawn(async move {
            let Ok(_permit) = sem.acquire_owned().await else {
                return;
            };
            let outcome = match load_one(&ctx, &problem_id).await {
                Ok(outcome) => outcome,
                Err(e) => Outcome::Skipped {
                    problem_id,
                    reason: e.to_string(),
                },
            };
            let _ = tx.send(outcome).await;
        });
    }

    // Drop our copy of tx so rx closes when all spawned tasks finish
    drop(tx);

    let mut stats = LoadStats {
        total,
        ..LoadStats::default()
    };

    while let Some(outcome) = rx.recv().await {
        match outcome {
            Outcome::Loaded {
                record,
                images,
                skipped_images,
            } => {
                for block in [&record.condition, &record.solution] {
                    debug!(
                        problem = %record.problem_id,
                        block = %block.block_type,
                        chars = block.text.chars().count(),
                        images = block.image_count(),
                        "block extracted"
                    );
                }
                match db::save_problem(conn, &record) {
                    Ok(_) => {
                        stats.ok += 1;
                        stats.images += images;
                        stats.image_failures += skipped_images;
                        info!(
                            problem = %record.problem_id,
                            images,
                            skipped_images,
                            "saved problem"
                        );
                    }
                    Err(e) => {
                        warn!("Failed to save {}: {:#}", record.problem_id, e);
                        stats.skipped += 1;
                    }
                }
            }
            Outcome::Skipped { problem_id, reason } => {
                warn!("Skipping {}: {}", problem_id, reason);
                stats.skipped += 1;
            }
        }
        pb.inc(1);
    }

    pb.finish_and_clear();
    info!(
        "Loaded {} problems ({} ok, {} skipped, {} images, {} image failures)",
        stats.total, stats.ok, stats.skipped, stats.images, stats.image_failures
    );

    Ok(stats)
}

async fn load_one<F: Fetch>(ctx: &LoadContext<F>, problem_id: &str) -> Result<Outcome, PageError> {
    let url = source::problem_url(&ctx.subject_code, &ctx.exam_type, problem_id);
    let page_url = Url::parse(&url).map_err(|e| FetchError::new(&url, e.to_string()))?;

    let body = ctx.fetcher.get(&url).await?;
    let html = String::from_utf8_lossy(&body);
    // The parsed document is not Send; it is dropped inside parse.
    let page = ProblemPage::parse(&html, &page_url)?;
    if let Some(err) = &page.malformed {
        warn!(problem = problem_id, "{}; storing empty blocks", err);
    }

    let extracted = parser::extract_problem(
        &page,
        &ctx.resolver,
        &ctx.template,
        &ctx.subject_code,
        problem_id,
    )
    .await;

    Ok(build_record(ctx, problem_id, url, page, extracted))
}

fn build_record<F>(
    ctx: &LoadContext<F>,
    problem_id: &str,
    url: String,
    page: ProblemPage,
    extracted: ExtractedProblem,
) -> Outcome {
    let images = extracted.condition.image_count() + extracted.solution.image_count();
    let skipped_images = extracted.condition.skipped_images + extracted.solution.skipped_images;
    let record = ProblemRecord {
        subject_code: ctx.subject_code.clone(),
        exam_type: ctx.exam_type.clone(),
        problem_id: problem_id.to_string(),
        url,
        topic_number: page.topic_number,
        answer: page.answer,
        condition: BlockRecord::from_block(BlockType::Condition, &extracted.condition),
        solution: BlockRecord::from_block(BlockType::Solution, &extracted.solution),
        analogs: page.analogs,
        loaded_at: chrono::Utc::now().to_rfc3339(),
    };
    Outcome::Loaded {
        record,
        images,
        skipped_images,
    }
}

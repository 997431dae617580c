pub mod cleanup;
pub mod dom;
pub mod extractor;
pub mod image;
pub mod page;

use crate::fetch::Fetch;
use dom::DomNode;
use extractor::{BlockExtractor, ExtractedBlock};
use image::{BlockType, ImageResolver, ReferenceTemplate};
use page::ProblemPage;

/// Both blocks of one problem. A block missing from the page comes back
/// empty.
#[derive(Debug, Clone, Default)]
pub struct ExtractedProblem {
    pub condition: ExtractedBlock,
    pub solution: ExtractedBlock,
}

/// Two-pass pipeline: page → (condition, solution) blocks → normalized
/// text with stored images.
pub async fn extract_problem<F: Fetch>(
    page: &ProblemPage,
    resolver: &ImageResolver<F>,
    template: &ReferenceTemplate,
    subject_code: &str,
    problem_id: &str,
) -> ExtractedProblem {
    let extractor = BlockExtractor::new(resolver, template);
    let key = (subject_code, problem_id);

    ExtractedProblem {
        condition: extract_block(&extractor, page.condition.as_ref(), key, BlockType::Condition)
            .await,
        solution: extract_block(&extractor, page.solution.as_ref(), key, BlockType::Solution)
            .await,
    }
}

async fn extract_block<F: Fetch>(
    extractor: &BlockExtractor<'_, F>,
    block: Option<&DomNode>,
    (subject_code, problem_id): (&str, &str),
    block_type: BlockType,
) -> ExtractedBlock {
    match block {
        Some(root) => {
            extractor
                .extract(root, subject_code, problem_id, block_type)
                .await
        }
        None => {
            extractor.discard(subject_code, problem_id, block_type).await;
            ExtractedBlock::default()
        }
    }
}

use tracing::warn;

use super::cleanup;
use super::dom::{DomNode, Element};
use super::image::{BlockType, ImageRef, ImageResolver, ReferenceTemplate};
use crate::fetch::Fetch;

/// Classes marking site scaffolding rather than problem content.
const BOILERPLATE_CLASSES: &[&str] = &["rule_info", "rule_body"];

/// How an element takes part in text extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Boilerplate,
    Image,
    LineBreak,
    Block,
    Inline,
}

/// Tag dispatch table. Tags not listed here are treated as inline.
const TAG_BEHAVIOR: &[(&str, Behavior)] = &[
    ("img", Behavior::Image),
    ("br", Behavior::LineBreak),
    ("p", Behavior::Block),
    ("div", Behavior::Block),
    ("span", Behavior::Inline),
    ("b", Behavior::Inline),
    ("i", Behavior::Inline),
    ("strong", Behavior::Inline),
    ("em", Behavior::Inline),
];

fn behavior(el: &Element) -> Behavior {
    if BOILERPLATE_CLASSES.iter().any(|c| el.has_class(c)) {
        return Behavior::Boilerplate;
    }
    TAG_BEHAVIOR
        .iter()
        .find(|(tag, _)| *tag == el.tag)
        .map(|(_, b)| *b)
        .unwrap_or(Behavior::Inline)
}

/// Output of the structural pass, in document order.
#[derive(Debug, Clone, PartialEq)]
enum Fragment {
    Text(String),
    /// Absolute image URL, resolved during assembly.
    Image(String),
    LineBreak,
    /// Newline unless the output is empty or already ends in one.
    Boundary,
}

fn collect(node: &DomNode, out: &mut Vec<Fragment>) {
    let el = match node {
        DomNode::Text(t) => {
            if !t.is_empty() {
                out.push(Fragment::Text(t.clone()));
            }
            return;
        }
        DomNode::Element(el) => el,
    };

    match behavior(el) {
        Behavior::Boilerplate => {}
        Behavior::Image => {
            if let Some(src) = el.attr("src").filter(|s| !s.trim().is_empty()) {
                out.push(Fragment::Image(src.to_string()));
            }
        }
        Behavior::LineBreak => out.push(Fragment::LineBreak),
        Behavior::Block => {
            out.push(Fragment::Boundary);
            collect_children(&el.children, out);
            out.push(Fragment::Boundary);
        }
        Behavior::Inline => collect_children(&el.children, out),
    }
}

fn collect_children(children: &[DomNode], out: &mut Vec<Fragment>) {
    for child in children {
        collect(child, out);
    }
}

/// Normalized text of one block plus the images it references.
///
/// `text` holds exactly one `![img](...)` token per entry in `images`, in
/// the same order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedBlock {
    pub text: String,
    pub images: Vec<ImageRef>,
    /// Image nodes whose download failed and were left out.
    pub skipped_images: usize,
}

impl ExtractedBlock {
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn storage_keys(&self) -> Vec<&str> {
        self.images.iter().map(|i| i.storage_key.as_str()).collect()
    }
}

/// Walks a condition or solution block and produces its text with inline
/// image tokens.
pub struct BlockExtractor<'a, F> {
    resolver: &'a ImageResolver<F>,
    template: &'a ReferenceTemplate,
}

impl<'a, F: Fetch> BlockExtractor<'a, F> {
    pub fn new(resolver: &'a ImageResolver<F>, template: &'a ReferenceTemplate) -> Self {
        BlockExtractor { resolver, template }
    }

    /// Extract `block_root`'s children. Never fails: an image that cannot
    /// be resolved is dropped without consuming an ordinal.
    pub async fn extract(
        &self,
        block_root: &DomNode,
        subject_code: &str,
        problem_id: &str,
        block_type: BlockType,
    ) -> ExtractedBlock {
        let mut fragments = Vec::new();
        collect_children(block_root.children(), &mut fragments);

        let mut text = String::new();
        let mut images: Vec<ImageRef> = Vec::new();
        let mut skipped_images = 0;

        for fragment in fragments {
            match fragment {
                Fragment::Text(t) => text.push_str(&t),
                Fragment::LineBreak => text.push('\n'),
                Fragment::Boundary => {
                    if !text.is_empty() && !text.ends_with('\n') {
                        text.push('\n');
                    }
                }
                Fragment::Image(src) => {
                    let ordinal = images.len();
                    match self
                        .resolver
                        .resolve(&src, subject_code, problem_id, block_type, ordinal)
                        .await
                    {
                        Ok(image) => {
                            text.push_str(&self.template.token(&image.storage_key));
                            images.push(image);
                        }
                        Err(e) => {
                            warn!(
                                subject = subject_code,
                                problem = problem_id,
                                block = %block_type,
                                kind = e.kind(),
                                "skipping image: {}",
                                e
                            );
                            skipped_images += 1;
                        }
                    }
                }
            }
        }

        self.resolver
            .prune_block(subject_code, problem_id, block_type, images.len())
            .await;

        ExtractedBlock {
            text: cleanup::normalize(&text, block_type),
            images,
            skipped_images,
        }
    }

    /// Remove every stored asset of a block the page no longer has.
    pub async fn discard(&self, subject_code: &str, problem_id: &str, block_type: BlockType) {
        self.resolver
            .prune_block(subject_code, problem_id, block_type, 0)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::image::tests::{MapFetcher, JPEG, PNG, SVG};
    use crate::parser::image::ImageFormat;
    use std::path::Path;
    use std::time::Duration;

    const BASE: &str = "http://img/";

    fn pbody(children: Vec<DomNode>) -> DomNode {
        DomNode::element("div", children).with_class("pbody")
    }

    fn p(children: Vec<DomNode>) -> DomNode {
        DomNode::element("p", children)
    }

    fn t(s: &str) -> DomNode {
        DomNode::text(s)
    }

    async fn run(
        fetcher: MapFetcher,
        root: &Path,
        block: &DomNode,
        block_type: BlockType,
    ) -> ExtractedBlock {
        let resolver = ImageResolver::new(fetcher, root, Duration::from_secs(5));
        let template = ReferenceTemplate::new(BASE);
        BlockExtractor::new(&resolver, &template)
            .extract(block, "math", "100", block_type)
            .await
    }

    fn token_count(text: &str) -> usize {
        text.matches("![img](").count()
    }

    #[test]
    fn dispatch_table() {
        let DomNode::Element(ruled) = DomNode::element("span", vec![]).with_class("rule_info")
        else {
            unreachable!()
        };
        assert_eq!(behavior(&ruled), Behavior::Boilerplate);
        let DomNode::Element(table) = DomNode::element("table", vec![]) else { unreachable!() };
        assert_eq!(behavior(&table), Behavior::Inline);
        let DomNode::Element(div) = DomNode::element("div", vec![]) else { unreachable!() };
        assert_eq!(behavior(&div), Behavior::Block);
    }

    #[test]
    fn structural_pass_order() {
        let block = pbody(vec![t("a"), DomNode::img("u1"), DomNode::element("br", vec![]), p(vec![t("b")])]);
        let mut out = Vec::new();
        collect_children(block.children(), &mut out);
        assert_eq!(
            out,
            vec![
                Fragment::Text("a".into()),
                Fragment::Image("u1".into()),
                Fragment::LineBreak,
                Fragment::Boundary,
                Fragment::Text("b".into()),
                Fragment::Boundary,
            ]
        );
    }

    #[tokio::test]
    async fn paragraph_image_paragraph() {
        let dir = tempfile::tempdir().unwrap();
        let block = pbody(vec![
            p(vec![t("Вычислите")]),
            DomNode::img("https://math-ege.sdamgia.ru/a.png"),
            p(vec![t("площадь")]),
        ]);
        let fetcher = MapFetcher::default().with("https://math-ege.sdamgia.ru/a.png", PNG);
        let out = run(fetcher, dir.path(), &block, BlockType::Condition).await;

        assert_eq!(
            out.text,
            "Вычислите\n![img](http://img/math/100/condition_0.png)\nплощадь"
        );
        assert_eq!(out.images.len(), 1);
        assert_eq!(out.images[0].ordinal, 0);
        assert_eq!(out.images[0].format, ImageFormat::Png);
        assert!(dir.path().join("math/100/condition_0.png").exists());
    }

    #[tokio::test]
    async fn inline_formula_keeps_running_text() {
        let dir = tempfile::tempdir().unwrap();
        let block = pbody(vec![p(vec![
            t("Найдите "),
            DomNode::element("span", vec![DomNode::img("https://f/x")]),
            t(", если "),
            DomNode::element("b", vec![t("x > 0")]),
        ])]);
        let fetcher = MapFetcher::default().with("https://f/x", SVG);
        let out = run(fetcher, dir.path(), &block, BlockType::Condition).await;
        assert_eq!(
            out.text,
            "Найдите ![img](http://img/math/100/condition_0.svg), если x > 0"
        );
    }

    #[tokio::test]
    async fn boilerplate_subtrees_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let block = pbody(vec![
            DomNode::element("div", vec![t("Правило"), DomNode::img("https://f/rule")])
                .with_class("rule_info"),
            DomNode::element("span", vec![t("scaffold")]).with_class("rule_body"),
            t("Условие"),
            DomNode::img("https://f/real"),
        ]);
        let fetcher = MapFetcher::default()
            .with("https://f/rule", PNG)
            .with("https://f/real", PNG);
        let out = run(fetcher, dir.path(), &block, BlockType::Condition).await;

        assert!(!out.text.contains("Правило"));
        assert!(!out.text.contains("scaffold"));
        assert_eq!(out.images.len(), 1);
        assert_eq!(out.images[0].source_url, "https://f/real");
        assert_eq!(out.images[0].ordinal, 0);
    }

    #[tokio::test]
    async fn failed_images_do_not_consume_ordinals() {
        let dir = tempfile::tempdir().unwrap();
        let block = pbody(vec![
            DomNode::img("https://f/ok1"),
            t(" "),
            DomNode::img("https://f/missing"),
            DomNode::img("https://f/empty"),
            t(" "),
            DomNode::img("https://f/ok2"),
            DomNode::img(""),
            DomNode::element("img", vec![]),
        ]);
        let fetcher = MapFetcher::default()
            .with("https://f/ok1", PNG)
            .with("https://f/empty", b"")
            .with("https://f/ok2", JPEG);
        let out = run(fetcher, dir.path(), &block, BlockType::Condition).await;

        let ordinals: Vec<usize> = out.images.iter().map(|i| i.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1]);
        assert_eq!(out.images[1].storage_key, "math/100/condition_1.jpg");
        assert_eq!(out.skipped_images, 2);
        assert_eq!(token_count(&out.text), out.images.len());
        assert_eq!(
            out.text,
            "![img](http://img/math/100/condition_0.png)  ![img](http://img/math/100/condition_1.jpg)"
        );
    }

    #[tokio::test]
    async fn ordinals_are_per_block_type() {
        let dir = tempfile::tempdir().unwrap();
        let condition = pbody(vec![DomNode::img("https://f/a")]);
        let solution = pbody(vec![t("Решение. "), DomNode::img("https://f/a")]);
        let fetcher = || MapFetcher::default().with("https://f/a", PNG);

        let c = run(fetcher(), dir.path(), &condition, BlockType::Condition).await;
        let s = run(fetcher(), dir.path(), &solution, BlockType::Solution).await;
        assert_eq!(c.images[0].storage_key, "math/100/condition_0.png");
        assert_eq!(s.images[0].storage_key, "math/100/solution_0.png");
        assert_eq!(s.text, "![img](http://img/math/100/solution_0.png)");
    }

    #[tokio::test]
    async fn solution_is_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let block = pbody(vec![
            p(vec![DomNode::element("b", vec![t("Решение.")])]),
            p(vec![t("Сторона равна 3, значит площадь 9.")]),
            p(vec![]),
            DomNode::element("br", vec![]),
            DomNode::element("br", vec![]),
            DomNode::element("br", vec![]),
            p(vec![t("Ответ: 9.")]),
        ]);
        let out = run(MapFetcher::default(), dir.path(), &block, BlockType::Solution).await;
        assert_eq!(out.text, "Сторона равна 3, значит площадь 9.");
    }

    #[tokio::test]
    async fn breaks_and_blank_lines_collapse() {
        let dir = tempfile::tempdir().unwrap();
        let br = || DomNode::element("br", vec![]);
        let block = pbody(vec![t("line1"), br(), br(), br(), br(), t("line2")]);
        let out = run(MapFetcher::default(), dir.path(), &block, BlockType::Condition).await;
        assert_eq!(out.text, "line1\n\nline2");
    }

    #[tokio::test]
    async fn boundary_respects_failed_image() {
        // A failed image contributes nothing, so the paragraph after it
        // must not open with a doubled newline.
        let dir = tempfile::tempdir().unwrap();
        let block = pbody(vec![
            t("a"),
            DomNode::element("br", vec![]),
            DomNode::img("https://f/missing"),
            p(vec![t("b")]),
        ]);
        let out = run(MapFetcher::default(), dir.path(), &block, BlockType::Condition).await;
        assert_eq!(out.text, "a\nb");
    }

    #[tokio::test]
    async fn rerun_with_fewer_images_leaves_no_stale_ordinal() {
        let dir = tempfile::tempdir().unwrap();
        let block = pbody(vec![
            DomNode::img("https://f/a"),
            DomNode::img("https://f/b"),
            DomNode::img("https://f/c"),
        ]);
        let all = MapFetcher::default()
            .with("https://f/a", PNG)
            .with("https://f/b", PNG)
            .with("https://f/c", SVG);
        let first = run(all, dir.path(), &block, BlockType::Condition).await;
        assert_eq!(first.images.len(), 3);

        let without_b = MapFetcher::default()
            .with("https://f/a", PNG)
            .with("https://f/c", SVG);
        let second = run(without_b, dir.path(), &block, BlockType::Condition).await;
        assert_eq!(
            second.storage_keys(),
            vec!["math/100/condition_0.png", "math/100/condition_1.svg"]
        );

        let mut names: Vec<String> = std::fs::read_dir(dir.path().join("math/100"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["condition_0.png", "condition_1.svg"]);
    }

    #[tokio::test]
    async fn extraction_is_deterministic() {
        let block = pbody(vec![
            p(vec![t("x"), DomNode::img("https://f/a")]),
            p(vec![DomNode::img("https://f/b")]),
        ]);
        let fetcher = || {
            MapFetcher::default()
                .with("https://f/a", PNG)
                .with("https://f/b", SVG)
        };
        let d1 = tempfile::tempdir().unwrap();
        let d2 = tempfile::tempdir().unwrap();
        let a = run(fetcher(), d1.path(), &block, BlockType::Condition).await;
        let b = run(fetcher(), d2.path(), &block, BlockType::Condition).await;
        assert_eq!(a, b);
        assert_eq!(a.storage_keys(), vec!["math/100/condition_0.png", "math/100/condition_1.svg"]);
    }
}

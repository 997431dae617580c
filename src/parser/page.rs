use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::dom::DomNode;
use crate::error::PageError;

static PROBLEM_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.prob_maindiv").unwrap());
static PBODY_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("div.pbody").unwrap());
static ANSWER_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("div.answer").unwrap());
static NUMS_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("span.prob_nums").unwrap());
static ANALOG_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("div.minor a").unwrap());

static ANSWER_IN_TEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)Ответ[:\s]+([^\n.]+)").unwrap());

/// Everything taken from one problem page. Blocks are owned snapshots so
/// the parsed document can be dropped immediately.
#[derive(Debug, Clone, Default)]
pub struct ProblemPage {
    pub condition: Option<DomNode>,
    pub solution: Option<DomNode>,
    pub answer: Option<String>,
    pub topic_number: Option<String>,
    pub analogs: Vec<String>,
    /// `MalformedDom` when the container held no content blocks.
    pub malformed: Option<PageError>,
}

impl ProblemPage {
    pub fn parse(html: &str, page_url: &Url) -> Result<Self, PageError> {
        let doc = Html::parse_document(html);
        let container = doc
            .select(&PROBLEM_SEL)
            .next()
            .ok_or_else(|| PageError::MissingBlock {
                url: page_url.to_string(),
            })?;

        let pbodies: Vec<ElementRef> = container.select(&PBODY_SEL).collect();
        let condition = pbodies.first().map(|el| DomNode::from_element(*el, Some(page_url)));
        let solution = pbodies.get(1).map(|el| DomNode::from_element(*el, Some(page_url)));

        let answer = container
            .select(&ANSWER_SEL)
            .next()
            .map(|el| clean_answer(&element_text(el)))
            .filter(|a| !a.is_empty())
            .or_else(|| {
                pbodies
                    .get(1)
                    .and_then(|el| answer_from_solution(&element_text(*el)))
            });

        let topic_number = container
            .select(&NUMS_SEL)
            .next()
            .and_then(|el| topic_number(&element_text(el)));

        let analogs = container
            .select(&ANALOG_SEL)
            .map(|a| element_text(a).trim().to_string())
            .filter(|t| !t.is_empty() && t.chars().all(|c| c.is_ascii_digit()))
            .collect();

        Ok(ProblemPage {
            condition,
            solution,
            answer,
            topic_number,
            analogs,
            malformed: pbodies.is_empty().then(|| PageError::MalformedDom {
                url: page_url.to_string(),
                detail: "no div.pbody blocks in problem container".to_string(),
            }),
        })
    }
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect()
}

/// Strip a leading "Ответ" label and optional colon.
pub fn clean_answer(raw: &str) -> String {
    let text = raw.trim();
    let lowered = text.to_lowercase();
    let rest = if lowered.starts_with("ответ") {
        // Same byte length in either case for this word.
        let label_len = "ответ".len();
        text[label_len..].trim_start()
    } else {
        text
    };
    rest.strip_prefix(':').unwrap_or(rest).trim().to_string()
}

pub fn answer_from_solution(text: &str) -> Option<String> {
    ANSWER_IN_TEXT_RE
        .captures(text)
        .map(|c| c[1].trim().trim_end_matches('.').to_string())
        .filter(|a| !a.is_empty())
}

/// "Тип 4 № 506304" → "4".
pub fn topic_number(nums: &str) -> Option<String> {
    let mut parts = nums.split_whitespace();
    while let Some(part) = parts.next() {
        if part == "Тип" {
            let digits: String = parts
                .next()?
                .chars()
                .filter(char::is_ascii_digit)
                .collect();
            if !digits.is_empty() {
                return Some(digits);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r##"<html><body>
        <div class="prob_maindiv">
          <span class="prob_nums">Тип 4 № 506304 <a href="#">i</a></span>
          <div class="pbody"><p>Найдите <img src="/formula/ab.svg"> при x=2</p></div>
          <div class="solution">
            <div class="pbody"><p>Решение. Подставим.</p><p>Ответ: 7.</p></div>
          </div>
          <div class="answer"><span>Ответ: 7</span></div>
          <div class="minor">Аналоги: <a href="/problem?id=11">11</a> <a href="/problem?id=12">12</a> <a href="/a">Все</a></div>
        </div></body></html>"##;

    fn url() -> Url {
        Url::parse("https://math-ege.sdamgia.ru/problem?id=506304").unwrap()
    }

    #[test]
    fn parses_full_page() {
        let page = ProblemPage::parse(PAGE, &url()).unwrap();
        assert!(page.condition.is_some());
        assert!(page.solution.is_some());
        assert!(page.malformed.is_none());
        assert_eq!(page.answer.as_deref(), Some("7"));
        assert_eq!(page.topic_number.as_deref(), Some("4"));
        assert_eq!(page.analogs, vec!["11", "12"]);
    }

    #[test]
    fn condition_images_absolutized() {
        let page = ProblemPage::parse(PAGE, &url()).unwrap();
        let cond = page.condition.unwrap();
        let p = &cond.children()[0];
        let img = p
            .children()
            .iter()
            .find_map(|c| match c {
                DomNode::Element(el) if el.tag == "img" => Some(el),
                _ => None,
            })
            .unwrap();
        assert_eq!(img.attr("src"), Some("https://math-ege.sdamgia.ru/formula/ab.svg"));
    }

    #[test]
    fn missing_container_is_missing_block() {
        let err = ProblemPage::parse("<html><body><p>404</p></body></html>", &url()).unwrap_err();
        assert!(matches!(err, PageError::MissingBlock { .. }));
    }

    #[test]
    fn empty_container_is_malformed() {
        let page =
            ProblemPage::parse("<div class=\"prob_maindiv\"><p>x</p></div>", &url()).unwrap();
        assert!(matches!(page.malformed, Some(PageError::MalformedDom { .. })));
        assert!(page.condition.is_none());
        assert!(page.solution.is_none());
    }

    #[test]
    fn answer_falls_back_to_solution_text() {
        let html = r#"<div class="prob_maindiv">
            <div class="pbody">Условие</div>
            <div class="pbody">Решение. Считаем. Ответ: 42. Конец</div></div>"#;
        let page = ProblemPage::parse(html, &url()).unwrap();
        assert_eq!(page.answer.as_deref(), Some("42"));
    }

    #[test]
    fn clean_answer_variants() {
        assert_eq!(clean_answer("Ответ: 12"), "12");
        assert_eq!(clean_answer("  ОТВЕТ 0,5 "), "0,5");
        assert_eq!(clean_answer("-3"), "-3");
    }

    #[test]
    fn topic_number_variants() {
        assert_eq!(topic_number("Тип 12 № 1").as_deref(), Some("12"));
        assert_eq!(topic_number("Тип Д3 № 5").as_deref(), Some("3"));
        assert_eq!(topic_number("№ 506304"), None);
    }
}

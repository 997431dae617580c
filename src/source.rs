use url::Url;

const SITE_DOMAIN: &str = "sdamgia.ru";

/// Base URL of the problem site for a subject and exam tier.
///
/// Pure function of its inputs: the same (subject, exam) pair always maps
/// to the same host.
pub fn base_url(subject_code: &str, exam_type: &str) -> String {
    let host_subject = match (subject_code, exam_type) {
        // Basic-level maths shares the regular maths site for OGE.
        ("mathb", "oge") => "math",
        ("russian", _) => "rus",
        (code, _) => code,
    };
    format!("https://{}-{}.{}", host_subject, exam_type, SITE_DOMAIN)
}

pub fn problem_url(subject_code: &str, exam_type: &str, problem_id: &str) -> String {
    format!("{}/problem?id={}", base_url(subject_code, exam_type), problem_id)
}

/// Resolve an `img` src against the page it appeared on. Handles absolute,
/// site-relative and protocol-relative forms; returns `None` for blank or
/// unparsable values.
pub fn absolutize(src: &str, page: &Url) -> Option<String> {
    let src = src.trim();
    if src.is_empty() {
        return None;
    }
    page.join(src).ok().map(|u| u.to_string())
}

pub fn subject_name(subject_code: &str) -> &str {
    match subject_code {
        "mathb" => "Математика (База)",
        "math" => "Математика (Профиль)",
        "bio" => "Биология",
        "rus" | "russian" => "Русский язык",
        "phys" => "Физика",
        "inf" => "Информатика",
        "chem" => "Химия",
        "geo" => "География",
        "soc" => "Обществознание",
        "hist" => "История",
        "lit" => "Литература",
        "en" => "Английский",
        "de" => "Немецкий",
        "fr" => "Французский",
        "sp" => "Испанский",
        other => other,
    }
}

/// Parse a comma separated id list, dropping blanks and duplicates while
/// keeping first-seen order.
pub fn parse_ids(raw: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for id in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !ids.iter().any(|seen| seen == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::parser::extractor::ExtractedBlock;
use crate::parser::image::BlockType;
use crate::source;

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let conn =
        Connection::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS subjects (
            id         INTEGER PRIMARY KEY,
            code       TEXT NOT NULL,
            exam_type  TEXT NOT NULL CHECK(exam_type IN ('ege','oge')),
            name       TEXT NOT NULL,
            UNIQUE(code, exam_type)
        );

        CREATE TABLE IF NOT EXISTS topics (
            id           INTEGER PRIMARY KEY,
            subject_id   INTEGER NOT NULL REFERENCES subjects(id) ON DELETE CASCADE,
            topic_number TEXT NOT NULL,
            topic_name   TEXT NOT NULL,
            UNIQUE(subject_id, topic_number)
        );

        CREATE TABLE IF NOT EXISTS problems (
            id               INTEGER PRIMARY KEY,
            subject_id       INTEGER NOT NULL REFERENCES subjects(id) ON DELETE CASCADE,
            topic_id         INTEGER REFERENCES topics(id) ON DELETE SET NULL,
            problem_id       TEXT NOT NULL,
            condition_text   TEXT NOT NULL DEFAULT '',
            condition_images TEXT NOT NULL DEFAULT '[]',
            solution_text    TEXT NOT NULL DEFAULT '',
            solution_images  TEXT NOT NULL DEFAULT '[]',
            answer           TEXT,
            url              TEXT NOT NULL,
            source           TEXT NOT NULL DEFAULT 'sdamgia',
            loaded_at        TEXT NOT NULL,
            UNIQUE(subject_id, problem_id)
        );
        CREATE INDEX IF NOT EXISTS idx_problems_topic ON problems(topic_id);

        CREATE TABLE IF NOT EXISTS problem_analogs (
            problem_id        INTEGER NOT NULL REFERENCES problems(id) ON DELETE CASCADE,
            analog_problem_id INTEGER NOT NULL REFERENCES problems(id) ON DELETE CASCADE,
            UNIQUE(problem_id, analog_problem_id)
        );
        ",
    )?;
    Ok(())
}

// ── Records ──

/// Persisted form of one extracted block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRecord {
    pub block_type: BlockType,
    pub text: String,
    pub image_keys: Vec<String>,
}

impl BlockRecord {
    pub fn from_block(block_type: BlockType, block: &ExtractedBlock) -> Self {
        BlockRecord {
            block_type,
            text: block.text.clone(),
            image_keys: block.storage_keys().into_iter().map(String::from).collect(),
        }
    }

    pub fn image_count(&self) -> usize {
        self.image_keys.len()
    }

    fn keys_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.image_keys)?)
    }
}

/// One problem ready for upsert, keyed by (subject, exam, problem id).
#[derive(Debug, Clone)]
pub struct ProblemRecord {
    pub subject_code: String,
    pub exam_type: String,
    pub problem_id: String,
    pub url: String,
    pub topic_number: Option<String>,
    pub answer: Option<String>,
    pub condition: BlockRecord,
    pub solution: BlockRecord,
    pub analogs: Vec<String>,
    pub loaded_at: String,
}

// ── Saving ──

/// Upsert a problem and its links in one transaction; the condition and
/// solution pair is committed together or not at all.
pub fn save_problem(conn: &Connection, rec: &ProblemRecord) -> Result<i64> {
    let tx = conn.unchecked_transaction()?;

    let subject_id = ensure_subject(&tx, &rec.subject_code, &rec.exam_type)?;
    let topic_id = match &rec.topic_number {
        Some(n) => Some(ensure_topic(&tx, subject_id, n)?),
        None => None,
    };

    let problem_db_id: i64 = tx.query_row(
        "INSERT INTO problems
         (subject_id, topic_id, problem_id, condition_text, condition_images,
          solution_text, solution_images, answer, url, loaded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(subject_id, problem_id) DO UPDATE SET
            topic_id = excluded.topic_id,
            condition_text = excluded.condition_text,
            condition_images = excluded.condition_images,
            solution_text = excluded.solution_text,
            solution_images = excluded.solution_images,
            answer = excluded.answer,
            url = excluded.url,
            loaded_at = excluded.loaded_at
         RETURNING id",
        params![
            subject_id,
            topic_id,
            rec.problem_id,
            rec.condition.text,
            rec.condition.keys_json()?,
            rec.solution.text,
            rec.solution.keys_json()?,
            rec.answer,
            rec.url,
            rec.loaded_at,
        ],
        |row| row.get(0),
    )?;

    {
        let mut find = tx.prepare("SELECT id FROM problems WHERE subject_id = ?1 AND problem_id = ?2")?;
        let mut link = tx.prepare(
            "INSERT OR IGNORE INTO problem_analogs (problem_id, analog_problem_id) VALUES (?1, ?2)",
        )?;
        for analog in &rec.analogs {
            let analog_id: Option<i64> = find
                .query_row(params![subject_id, analog], |r| r.get(0))
                .optional()?;
            // Analogs not loaded yet are linked when they are.
            if let Some(analog_id) = analog_id.filter(|id| *id != problem_db_id) {
                link.execute(params![problem_db_id, analog_id])?;
                link.execute(params![analog_id, problem_db_id])?;
            }
        }
    }

    tx.commit()?;
    Ok(problem_db_id)
}

fn ensure_subject(conn: &Connection, code: &str, exam_type: &str) -> Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO subjects (code, exam_type, name) VALUES (?1, ?2, ?3)",
        params![code, exam_type, source::subject_name(code)],
    )?;
    let id = conn.query_row(
        "SELECT id FROM subjects WHERE code = ?1 AND exam_type = ?2",
        params![code, exam_type],
        |r| r.get(0),
    )?;
    Ok(id)
}

fn ensure_topic(conn: &Connection, subject_id: i64, topic_number: &str) -> Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO topics (subject_id, topic_number, topic_name) VALUES (?1, ?2, ?3)",
        params![subject_id, topic_number, format!("Задание {}", topic_number)],
    )?;
    let id = conn.query_row(
        "SELECT id FROM topics WHERE subject_id = ?1 AND topic_number = ?2",
        params![subject_id, topic_number],
        |r| r.get(0),
    )?;
    Ok(id)
}

// ── Reading ──

#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub struct StoredProblem {
    pub condition_text: String,
    pub condition_images: Vec<String>,
    pub solution_text: String,
    pub solution_images: Vec<String>,
    pub answer: Option<String>,
    pub topic_number: Option<String>,
}

#[cfg(test)]
pub fn fetch_problem(
    conn: &Connection,
    subject_code: &str,
    exam_type: &str,
    problem_id: &str,
) -> Result<Option<StoredProblem>> {
    let row = conn
        .query_row(
            "SELECT p.condition_text, p.condition_images, p.solution_text, p.solution_images,
                    p.answer, t.topic_number
             FROM problems p
             JOIN subjects s ON s.id = p.subject_id
             LEFT JOIN topics t ON t.id = p.topic_id
             WHERE s.code = ?1 AND s.exam_type = ?2 AND p.problem_id = ?3",
            params![subject_code, exam_type, problem_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .optional()?;

    row.map(|(ct, ci, st, si, answer, topic_number)| -> Result<StoredProblem> {
        Ok(StoredProblem {
            condition_text: ct,
            condition_images: serde_json::from_str(&ci)?,
            solution_text: st,
            solution_images: serde_json::from_str(&si)?,
            answer,
            topic_number,
        })
    })
    .transpose()
}

// ── Stats ──

pub struct Stats {
    pub subjects: usize,
    pub problems: usize,
    pub with_solution: usize,
    pub images: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let subjects: usize = conn.query_row("SELECT COUNT(*) FROM subjects", [], |r| r.get(0))?;
    let problems: usize = conn.query_row("SELECT COUNT(*) FROM problems", [], |r| r.get(0))?;
    let with_solution: usize = conn.query_row(
        "SELECT COUNT(*) FROM problems WHERE solution_text != ''",
        [],
        |r| r.get(0),
    )?;
    let images: usize = conn.query_row(
        "SELECT COALESCE(SUM(json_array_length(condition_images) + json_array_length(solution_images)), 0)
         FROM problems",
        [],
        |r| r.get(0),
    )?;
    Ok(Stats {
        subjects,
        problems,
        with_solution,
        images,
    })
}

// ── Cleanup ──

/// Delete every row belonging to `subject_code` (all exam tiers).
/// Returns the number of problems removed.
pub fn clean_subject(conn: &Connection, subject_code: &str) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let removed = tx.execute(
        "DELETE FROM problems WHERE subject_id IN (SELECT id FROM subjects WHERE code = ?1)",
        params![subject_code],
    )?;
    tx.execute(
        "DELETE FROM topics WHERE subject_id IN (SELECT id FROM subjects WHERE code = ?1)",
        params![subject_code],
    )?;
    tx.execute("DELETE FROM subjects WHERE code = ?1", params![subject_code])?;
    tx.commit()?;
    Ok(removed)
}

pub fn clean_all(conn: &Connection) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM problem_analogs", [])?;
    let removed = tx.execute("DELETE FROM problems", [])?;
    tx.execute("DELETE FROM topics", [])?;
    tx.execute("DELETE FROM subjects", [])?;
    tx.commit()?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn block(block_type: BlockType, text: &str, keys: &[&str]) -> BlockRecord {
        BlockRecord {
            block_type,
            text: text.to_string(),
            image_keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    fn record(problem_id: &str, condition: &str, analogs: &[&str]) -> ProblemRecord {
        ProblemRecord {
            subject_code: "math".into(),
            exam_type: "ege".into(),
            problem_id: problem_id.into(),
            url: format!("https://math-ege.sdamgia.ru/problem?id={}", problem_id),
            topic_number: Some("4".into()),
            answer: Some("7".into()),
            condition: block(BlockType::Condition, condition, &["math/1/condition_0.png"]),
            solution: block(BlockType::Solution, "решение", &[]),
            analogs: analogs.iter().map(|a| a.to_string()).collect(),
            loaded_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn upsert_is_keyed_by_subject_and_problem() {
        let conn = conn();
        let first = save_problem(&conn, &record("1", "old", &[])).unwrap();
        let second = save_problem(&conn, &record("1", "new", &[])).unwrap();
        assert_eq!(first, second);

        let stored = fetch_problem(&conn, "math", "ege", "1").unwrap().unwrap();
        assert_eq!(stored.condition_text, "new");
        assert_eq!(stored.condition_images, vec!["math/1/condition_0.png"]);
        assert_eq!(stored.topic_number.as_deref(), Some("4"));

        let s = get_stats(&conn).unwrap();
        assert_eq!((s.subjects, s.problems, s.with_solution, s.images), (1, 1, 1, 1));
    }

    #[test]
    fn analogs_linked_both_ways_once_present() {
        let conn = conn();
        save_problem(&conn, &record("1", "a", &["2"])).unwrap();
        let links: usize = conn
            .query_row("SELECT COUNT(*) FROM problem_analogs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(links, 0);

        save_problem(&conn, &record("2", "b", &["1"])).unwrap();
        let links: usize = conn
            .query_row("SELECT COUNT(*) FROM problem_analogs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(links, 2);
    }

    #[test]
    fn clean_subject_removes_rows() {
        let conn = conn();
        save_problem(&conn, &record("1", "a", &[])).unwrap();
        save_problem(&conn, &record("2", "b", &["1"])).unwrap();
        assert_eq!(clean_subject(&conn, "math").unwrap(), 2);
        assert_eq!(get_stats(&conn).unwrap().problems, 0);
        assert!(fetch_problem(&conn, "math", "ege", "1").unwrap().is_none());
    }

    #[test]
    fn missing_problem_is_none() {
        let conn = conn();
        assert!(fetch_problem(&conn, "bio", "oge", "5").unwrap().is_none());
    }
}

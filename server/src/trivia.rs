//! Trivia questions: the provider interface the orchestrator calls and a
//! file-backed question bank.
//!
//! The bank reads `<dir>/<category>/<difficulty>.json` files in the common
//! open-trivia dump format and serves questions biased toward a player's
//! specialties while skipping questions that player has already seen.

use crate::error::{SessionError, SessionResult};
use crate::utils::decode_html_entities;
use log::{debug, info, warn};
use mosaic_shared::{Category, Difficulty, TRIVIA_ANSWER_TIMEOUT_SECS};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

const MAX_QUESTION_LENGTH: usize = 500;

/// A question as sent to a player. The answer never leaves the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub text: String,
    pub category: Category,
    pub difficulty: Difficulty,
    pub time_limit: u64,
    pub options: Vec<String>,
    pub is_specialty: bool,
    #[serde(skip)]
    pub correct_answer: String,
}

/// Inputs for picking one player's next question.
#[derive(Debug, Clone, Copy)]
pub struct QuestionRequest<'a> {
    pub difficulty: Difficulty,
    pub specialties: &'a [Category],
    pub asked: &'a HashSet<String>,
}

/// Source of trivia questions and judge of answers.
pub trait QuestionProvider: Send + Sync {
    fn next_question(&self, request: &QuestionRequest<'_>) -> SessionResult<Question>;

    fn is_correct(&self, question: &Question, answer: &str) -> bool {
        answers_match(&question.correct_answer, answer)
    }

    fn question_count(&self) -> usize;
}

#[derive(Debug, Error)]
pub enum TriviaLoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("no trivia questions found under {0}")]
    Empty(PathBuf),
}

#[derive(Debug, Deserialize)]
struct TriviaFile {
    #[serde(default)]
    response_code: i32,
    results: Vec<RawQuestion>,
}

#[derive(Debug, Deserialize)]
struct RawQuestion {
    question: String,
    correct_answer: String,
    incorrect_answers: Vec<String>,
}

/// In-memory pool of questions keyed by category and difficulty.
#[derive(Debug, Default)]
pub struct QuestionBank {
    pools: HashMap<(Category, Difficulty), Vec<Question>>,
}

impl QuestionBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_questions(questions: impl IntoIterator<Item = Question>) -> Self {
        let mut bank = Self::new();
        for question in questions {
            bank.insert(question);
        }
        bank
    }

    pub fn insert(&mut self, question: Question) {
        self.pools
            .entry((question.category, question.difficulty))
            .or_default()
            .push(question);
    }

    /// Loads every `<category>/<difficulty>.json` under `dir`.
    ///
    /// Missing or malformed files are skipped with a warning; an empty result
    /// is an error since the game cannot run without questions.
    pub fn load_dir(dir: &Path) -> Result<Self, TriviaLoadError> {
        let mut bank = Self::new();

        for category in Category::ALL {
            for difficulty in Difficulty::ALL {
                let path = dir
                    .join(category.as_str())
                    .join(format!("{}.json", difficulty.as_str()));
                if !path.exists() {
                    debug!("No trivia file at {}", path.display());
                    continue;
                }
                match Self::load_file(&path, *category, *difficulty) {
                    Ok(questions) => {
                        info!(
                            "Loaded {} {} {} questions",
                            questions.len(),
                            difficulty,
                            category
                        );
                        for question in questions {
                            bank.insert(question);
                        }
                    }
                    Err(e) => warn!("Skipping trivia file: {}", e),
                }
            }
        }

        if bank.is_empty() {
            return Err(TriviaLoadError::Empty(dir.to_path_buf()));
        }
        Ok(bank)
    }

    fn load_file(
        path: &Path,
        category: Category,
        difficulty: Difficulty,
    ) -> Result<Vec<Question>, TriviaLoadError> {
        let raw = std::fs::read_to_string(path).map_err(|source| TriviaLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw, category, difficulty).map_err(|source| TriviaLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parses one dump file, dropping entries that cannot be asked.
    pub fn parse(
        raw: &str,
        category: Category,
        difficulty: Difficulty,
    ) -> Result<Vec<Question>, serde_json::Error> {
        let file: TriviaFile = serde_json::from_str(raw)?;
        if file.response_code != 0 {
            warn!(
                "{} {} dump has response code {}",
                category, difficulty, file.response_code
            );
        }

        let mut rng = rand::thread_rng();
        let questions = file
            .results
            .into_iter()
            .enumerate()
            .filter_map(|(index, raw)| {
                let text = decode_html_entities(&raw.question);
                let correct = decode_html_entities(&raw.correct_answer);
                if text.is_empty() || correct.is_empty() || text.len() > MAX_QUESTION_LENGTH {
                    return None;
                }

                let mut options = vec![correct.clone()];
                for incorrect in &raw.incorrect_answers {
                    let cleaned = decode_html_entities(incorrect);
                    if !cleaned.is_empty() && cleaned != correct {
                        options.push(cleaned);
                    }
                }
                if options.len() < 2 {
                    return None;
                }
                options.shuffle(&mut rng);

                Some(Question {
                    id: format!("{}_{}_{}", category, difficulty, index),
                    text,
                    category,
                    difficulty,
                    time_limit: TRIVIA_ANSWER_TIMEOUT_SECS,
                    options,
                    is_specialty: false,
                    correct_answer: correct,
                })
            })
            .collect();
        Ok(questions)
    }

    pub fn len(&self) -> usize {
        self.pools.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, category: Category, difficulty: Difficulty) -> usize {
        self.pools
            .get(&(category, difficulty))
            .map_or(0, Vec::len)
    }

    /// Categories with at least one question at `difficulty`.
    fn categories_at(&self, difficulty: Difficulty) -> Vec<Category> {
        Category::ALL
            .iter()
            .copied()
            .filter(|category| self.count(*category, difficulty) > 0)
            .collect()
    }

    /// A question from the category, preferring `difficulty` and unseen ones.
    fn pick(
        &self,
        category: Category,
        difficulty: Difficulty,
        asked: &HashSet<String>,
        rng: &mut impl Rng,
    ) -> Option<Question> {
        let mut levels = vec![difficulty];
        levels.extend(Difficulty::ALL.iter().copied().filter(|d| *d != difficulty));

        for level in levels {
            let Some(pool) = self.pools.get(&(category, level)) else {
                continue;
            };
            let fresh: Vec<&Question> = pool.iter().filter(|q| !asked.contains(&q.id)).collect();
            let chosen = if fresh.is_empty() {
                pool.choose(rng)
            } else {
                fresh.choose(rng).copied()
            };
            if let Some(question) = chosen {
                return Some(question.clone());
            }
        }
        None
    }
}

impl QuestionProvider for QuestionBank {
    fn next_question(&self, request: &QuestionRequest<'_>) -> SessionResult<Question> {
        let mut rng = rand::thread_rng();
        let time_limit = (TRIVIA_ANSWER_TIMEOUT_SECS as f64
            * request.difficulty.modifiers().time_limit)
            .round() as u64;

        if !request.specialties.is_empty()
            && rng.gen_bool(request.difficulty.specialty_chance())
        {
            let mut specialties = request.specialties.to_vec();
            specialties.shuffle(&mut rng);
            let harder = request.difficulty.harder();
            for category in specialties {
                if let Some(mut question) = self.pick(category, harder, request.asked, &mut rng) {
                    question.is_specialty = true;
                    question.time_limit = time_limit;
                    return Ok(question);
                }
            }
        }

        let mut categories = self.categories_at(request.difficulty);
        if categories.is_empty() {
            categories = Category::ALL.to_vec();
        }
        categories.shuffle(&mut rng);

        for category in categories {
            if let Some(mut question) =
                self.pick(category, request.difficulty, request.asked, &mut rng)
            {
                question.time_limit = time_limit;
                return Ok(question);
            }
        }

        Err(SessionError::not_found(
            "question",
            format!("any {} question", request.difficulty),
        ))
    }

    fn question_count(&self) -> usize {
        self.len()
    }
}

fn normalize_answer(answer: &str) -> String {
    let lowered: String = answer
        .to_lowercase()
        .chars()
        .filter(|c| !matches!(c, '.' | ',' | '!' | '?' | '\'' | '"' | '(' | ')'))
        .collect();
    let words: Vec<&str> = lowered.split_whitespace().collect();
    let words = match words.first() {
        Some(&"the") | Some(&"a") | Some(&"an") if words.len() > 1 => &words[1..],
        _ => &words[..],
    };
    words.join(" ")
}

/// Case, whitespace, punctuation and leading-article insensitive comparison.
pub fn answers_match(correct: &str, given: &str) -> bool {
    let given = normalize_answer(given);
    !given.is_empty() && normalize_answer(correct) == given
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(id: &str, category: Category, difficulty: Difficulty) -> Question {
        Question {
            id: id.to_string(),
            text: format!("Question {}", id),
            category,
            difficulty,
            time_limit: TRIVIA_ANSWER_TIMEOUT_SECS,
            options: vec!["Yes".into(), "No".into()],
            is_specialty: false,
            correct_answer: "Yes".into(),
        }
    }

    #[test]
    fn test_answers_match() {
        assert!(answers_match("The Beatles", "beatles"));
        assert!(answers_match("Mount Everest", "  mount   everest! "));
        assert!(answers_match("O'Brien", "obrien"));
        assert!(!answers_match("Paris", "London"));
        assert!(!answers_match("Paris", ""));
        // A bare article is an answer, not a prefix
        assert!(answers_match("A", "a"));
    }

    #[test]
    fn test_parse_open_trivia_dump() {
        let raw = r#"{
            "response_code": 0,
            "results": [
                {"question": "Who composed &quot;The Four Seasons&quot;?",
                 "correct_answer": "Vivaldi",
                 "incorrect_answers": ["Bach", "Mozart", "Vivaldi"]},
                {"question": "", "correct_answer": "x", "incorrect_answers": ["y"]},
                {"question": "Only one option?", "correct_answer": "x", "incorrect_answers": []}
            ]
        }"#;
        let questions = QuestionBank::parse(raw, Category::Music, Difficulty::Easy).unwrap();
        assert_eq!(questions.len(), 1);

        let q = &questions[0];
        assert_eq!(q.id, "music_easy_0");
        assert_eq!(q.text, "Who composed \"The Four Seasons\"?");
        assert_eq!(q.options.len(), 3);
        assert!(q.options.contains(&"Vivaldi".to_string()));
    }

    #[test]
    fn test_correct_answer_is_not_serialized() {
        let q = question("q1", Category::Science, Difficulty::Medium);
        let json = serde_json::to_value(&q).unwrap();
        assert!(json.get("correctAnswer").is_none());
        assert_eq!(json["isSpecialty"], false);
    }

    #[test]
    fn test_next_question_avoids_repeats() {
        let bank = QuestionBank::from_questions(vec![
            question("h1", Category::History, Difficulty::Medium),
            question("h2", Category::History, Difficulty::Medium),
        ]);
        let asked: HashSet<String> = ["h1".to_string()].into_iter().collect();
        let request = QuestionRequest {
            difficulty: Difficulty::Medium,
            specialties: &[],
            asked: &asked,
        };

        for _ in 0..20 {
            assert_eq!(bank.next_question(&request).unwrap().id, "h2");
        }
    }

    #[test]
    fn test_next_question_repeats_when_exhausted() {
        let bank =
            QuestionBank::from_questions(vec![question("g1", Category::General, Difficulty::Easy)]);
        let asked: HashSet<String> = ["g1".to_string()].into_iter().collect();
        let request = QuestionRequest {
            difficulty: Difficulty::Easy,
            specialties: &[],
            asked: &asked,
        };
        assert_eq!(bank.next_question(&request).unwrap().id, "g1");
    }

    #[test]
    fn test_specialty_questions_are_harder_and_flagged() {
        let bank = QuestionBank::from_questions(vec![
            question("m-hard", Category::Music, Difficulty::Hard),
            question("s-med", Category::Science, Difficulty::Medium),
        ]);
        let asked = HashSet::new();
        let request = QuestionRequest {
            difficulty: Difficulty::Medium,
            specialties: &[Category::Music],
            asked: &asked,
        };

        let mut saw_specialty = false;
        for _ in 0..200 {
            let q = bank.next_question(&request).unwrap();
            if q.is_specialty {
                assert_eq!(q.category, Category::Music);
                assert_eq!(q.difficulty, Difficulty::Hard);
                saw_specialty = true;
            }
        }
        assert!(saw_specialty);
    }

    #[test]
    fn test_time_limit_follows_difficulty() {
        let bank =
            QuestionBank::from_questions(vec![question("e1", Category::General, Difficulty::Hard)]);
        let asked = HashSet::new();
        let request = QuestionRequest {
            difficulty: Difficulty::Hard,
            specialties: &[],
            asked: &asked,
        };
        assert_eq!(bank.next_question(&request).unwrap().time_limit, 21);
    }

    #[test]
    fn test_empty_bank_reports_not_found() {
        let bank = QuestionBank::new();
        let asked = HashSet::new();
        let request = QuestionRequest {
            difficulty: Difficulty::Easy,
            specialties: &[Category::Music],
            asked: &asked,
        };
        assert_eq!(bank.next_question(&request).unwrap_err().kind(), "not_found");
        assert_eq!(bank.question_count(), 0);
    }

    #[test]
    fn test_load_dir_reads_category_files() {
        let dir = std::env::temp_dir().join(format!("mosaic-trivia-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("science")).unwrap();
        std::fs::write(
            dir.join("science").join("easy.json"),
            r#"{"response_code":0,"results":[{"question":"H2O?","correct_answer":"Water","incorrect_answers":["Fire"]}]}"#,
        )
        .unwrap();

        let bank = QuestionBank::load_dir(&dir).unwrap();
        assert_eq!(bank.count(Category::Science, Difficulty::Easy), 1);

        let empty = std::env::temp_dir().join(format!("mosaic-empty-{}", uuid::Uuid::new_v4()));
        assert!(matches!(
            QuestionBank::load_dir(&empty),
            Err(TriviaLoadError::Empty(_))
        ));

        let _ = std::fs::remove_dir_all(dir);
    }
}

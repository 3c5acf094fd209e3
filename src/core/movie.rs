use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::core::validator::{Validator, unique};

/// First year a film could plausibly have been released.
pub const EARLIEST_YEAR: i32 = 1888;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Movie {
    pub id: i64,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    pub title: String,
    #[serde(skip_serializing_if = "is_zero")]
    pub year: i32,
    /// Minutes.
    #[serde(skip_serializing_if = "is_zero")]
    pub runtime: i32,
    pub genres: Vec<String>,
    pub version: i32,
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

/// User-supplied movie fields, used both for creation and as the merged
/// result of a partial update.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MovieInput {
    pub title: String,
    pub year: i32,
    pub runtime: i32,
    pub genres: Vec<String>,
}

impl From<&Movie> for MovieInput {
    fn from(movie: &Movie) -> Self {
        Self {
            title: movie.title.clone(),
            year: movie.year,
            runtime: movie.runtime,
            genres: movie.genres.clone(),
        }
    }
}

/// Partial update body; absent fields keep their stored values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MoviePatch {
    pub title: Option<String>,
    pub year: Option<i32>,
    pub runtime: Option<i32>,
    pub genres: Option<Vec<String>>,
}

impl MoviePatch {
    pub fn apply(self, input: &mut MovieInput) {
        if let Some(title) = self.title {
            input.title = title;
        }
        if let Some(year) = self.year {
            input.year = year;
        }
        if let Some(runtime) = self.runtime {
            input.runtime = runtime;
        }
        if let Some(genres) = self.genres {
            input.genres = genres;
        }
    }
}

pub fn validate_movie(v: &mut Validator, input: &MovieInput) {
    v.check(!input.title.is_empty(), "title", "must be provided");
    v.check(
        input.title.len() <= 500,
        "title",
        "must not be more than 500 bytes long",
    );

    v.check(input.year != 0, "year", "must be provided");
    v.check(input.year >= EARLIEST_YEAR, "year", "must be greater than 1888");
    v.check(
        input.year <= Utc::now().year(),
        "year",
        "must not be in the future",
    );

    v.check(input.runtime != 0, "runtime", "must be provided");
    v.check(input.runtime > 0, "runtime", "must be a positive integer");

    v.check(!input.genres.is_empty(), "genres", "must contain at least 1 genre");
    v.check(
        input.genres.len() <= 5,
        "genres",
        "must not contain more than 5 genres",
    );
    v.check(unique(&input.genres), "genres", "must not contain duplicate values");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn casablanca() -> MovieInput {
        MovieInput {
            title: "Casablanca".to_string(),
            year: 1942,
            runtime: 102,
            genres: vec!["drama".to_string(), "romance".to_string()],
        }
    }

    #[test]
    fn valid_movie_passes() {
        let mut v = Validator::new();
        validate_movie(&mut v, &casablanca());
        assert!(v.valid(), "{:?}", v.errors());
    }

    #[test]
    fn each_field_is_checked() {
        let input = MovieInput {
            title: String::new(),
            year: 1850,
            runtime: -5,
            genres: vec!["drama".to_string(), "drama".to_string()],
        };
        let mut v = Validator::new();
        validate_movie(&mut v, &input);

        let errors = v.into_errors();
        assert_eq!(errors["title"], "must be provided");
        assert_eq!(errors["year"], "must be greater than 1888");
        assert_eq!(errors["runtime"], "must be a positive integer");
        assert_eq!(errors["genres"], "must not contain duplicate values");
    }

    #[test]
    fn patch_keeps_absent_fields() {
        let mut input = casablanca();
        MoviePatch {
            runtime: Some(103),
            ..Default::default()
        }
        .apply(&mut input);

        assert_eq!(input.runtime, 103);
        assert_eq!(input.title, "Casablanca");
        assert_eq!(input.genres.len(), 2);
    }
}

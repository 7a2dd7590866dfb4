use payline_core::repository::{Cursor, Page};
use serde::{Deserialize, Serialize};
use crate::error::AppError;

pub const DEFAULT_LIMIT: usize = 20;

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
    pub status: Option<String>,
}

impl PageQuery {
    pub fn cursor(&self) -> Result<Option<Cursor>, AppError> {
        match self.cursor.as_deref() {
            None | Some("") => Ok(None),
            Some(raw) => Cursor::decode(raw)
                .map(Some)
                .ok_or_else(|| AppError::ValidationError("invalid cursor".to_string())),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }
}

#[derive(Debug, Serialize)]
pub struct PageResponse<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> From<Page<T>> for PageResponse<T> {
    fn from(page: Page<T>) -> Self {
        Self {
            items: page.items,
            next_cursor: page.next_cursor.map(|c| c.encode()),
        }
    }
}

/// Application name
pub const APP_NAME: &str = "Fellowship";

/// Length of generated group invite codes
pub const INVITE_CODE_LEN: usize = 8;

/// Maximum group name length in characters
pub const MAX_GROUP_NAME_LEN: usize = 80;

/// Maximum group description length in characters
pub const MAX_GROUP_DESCRIPTION_LEN: usize = 1_000;

/// Maximum message body length in characters
pub const MAX_BODY_LEN: usize = 4_000;

/// Maximum number of scripture references attached to one verse message
pub const MAX_VERSE_REFS: usize = 20;

/// Default page size for message and discovery listings
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Upper bound for any requested page size
pub const MAX_PAGE_SIZE: u32 = 100;

/// Assistant questions per UTC day without `unlimited_ai_guide`
pub const DEFAULT_FREE_DAILY_AI_QUESTIONS: u32 = 5;

/// Maximum assistant question length in characters
pub const MAX_QUESTION_LEN: usize = 2_000;

/// Clamp a caller-supplied page size into `1..=MAX_PAGE_SIZE`.
pub fn clamp_page_size(requested: Option<u32>) -> u32 {
    requested.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

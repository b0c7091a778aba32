//! Concrete listener implementations (spec.md §4.7).

pub mod discord;
pub mod file_watch;
pub mod http;
pub mod slack;
pub mod telegram;

pub use discord::DiscordListener;
pub use file_watch::FileWatchListener;
pub use http::HttpWebhookListener;
pub use telegram::TelegramListener;

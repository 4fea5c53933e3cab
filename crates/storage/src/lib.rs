//! SQLite persistence for conversations, messages, contact channels, and
//! dead letters. Repositories are concrete structs over a shared pool and
//! return fully-populated value objects.

pub mod contacts;
pub mod conversations;
pub mod database;
pub mod dead_letter;
pub mod messages;
pub mod models;

pub use {
    contacts::ContactChannelRepo,
    conversations::{ConversationRepo, NewConversation},
    database::{connect, run_migrations},
    dead_letter::DeadLetterRepo,
    messages::MessageRepo,
    models::{ContactChannel, Conversation, DeadLetter, Message, NewMessage},
};

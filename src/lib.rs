// ABOUTME: DingTalk Stream-mode bot bridge for AI agents.
// ABOUTME: Stream gateway client, reply routing, card streaming, and agent dispatch.

pub mod card;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod handler;
pub mod inbound;
pub mod media;
pub mod monitor;
pub mod outbound;
pub mod session;
pub mod stream;
pub mod target;
pub mod text;
pub mod token;

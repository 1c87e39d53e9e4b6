//! Telegram interface: dispatcher wiring, the per-chat pipeline
//! (allowlist, abort, quick commands, dedupe, queue+lock), streamed reply
//! editing, and delivery of observer results.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use teloxide::dispatching::UpdateFilterExt;
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::types::{
    ChatAction, InlineKeyboardButton, InlineKeyboardMarkup, MaybeInaccessibleMessage, MessageId,
    ReplyParameters, ThreadId,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::gate::{is_abort_message, is_quick_command, ChatGate, MQ_PREFIX};
use crate::config::{AgentConfig, StreamingConfig};
use crate::core::cli::service::StreamSink;
use crate::core::notify::Notifier;
use crate::core::orchestrator::commands::stop_text;
use crate::core::orchestrator::Orchestrator;
use crate::core::webhook::observer::WakeHandler;
use crate::core::webhook::store::WebhookResult;
use crate::errors::CoreResult;

const QUEUE_INDICATOR: &str = "[Message in queue...]";
const CANCELLED_INDICATOR: &str = "[Message cancelled.]";
const DISCARDED_INDICATOR: &str = "[Message discarded.]";

/// Telegram caps messages at 4096 chars; stay under it with headroom.
const CHUNK_LIMIT: usize = 4000;

pub struct AppState {
    pub bot: Bot,
    pub config: Arc<AgentConfig>,
    pub orchestrator: Arc<Orchestrator>,
    pub gate: Arc<ChatGate>,
}

fn reply_params(message_id: MessageId) -> ReplyParameters {
    ReplyParameters {
        allow_sending_without_reply: Some(true),
        ..ReplyParameters::new(message_id)
    }
}

fn chunk_text(text: &str) -> Vec<String> {
    if text.len() <= CHUNK_LIMIT {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.split_inclusive('\n') {
        if current.len() + line.len() > CHUNK_LIMIT && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        // A single line longer than the limit is split hard.
        if line.len() > CHUNK_LIMIT {
            let mut rest = line;
            while rest.len() > CHUNK_LIMIT {
                let split_at = (0..=CHUNK_LIMIT)
                    .rev()
                    .find(|i| rest.is_char_boundary(*i))
                    .unwrap_or(0);
                chunks.push(rest[..split_at].to_string());
                rest = &rest[split_at..];
            }
            current.push_str(rest);
        } else {
            current.push_str(line);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Send `text` in chunks. The first chunk replies to `reply_to` (which
/// also pins it to the origin's forum topic); every chunk carries the
/// explicit thread id so continuations stay in the same topic.
async fn send_text(
    bot: &Bot,
    chat_id: ChatId,
    text: &str,
    reply_to: Option<MessageId>,
    thread: Option<ThreadId>,
) {
    if text.trim().is_empty() {
        return;
    }
    let chunks = chunk_text(text);
    let mut first = true;
    for chunk in chunks {
        let mut request = bot.send_message(chat_id, chunk);
        if let Some(thread_id) = thread {
            request = request.message_thread_id(thread_id);
        }
        if first {
            if let Some(message_id) = reply_to {
                request = request.reply_parameters(reply_params(message_id));
            }
            first = false;
        }
        if let Err(err) = request.await {
            warn!("Failed to send message to {chat_id}: {err}");
            return;
        }
    }
}

async fn edit_indicator(bot: &Bot, chat_id: ChatId, message_id: i32, text: &str) {
    if let Err(err) = bot
        .edit_message_text(chat_id, MessageId(message_id), text)
        .await
    {
        // Transport hiccups on indicator edits never block the pipeline.
        debug!("Failed to edit queue indicator: {err}");
    }
}

// ---------------------------------------------------------------------------
// Streamed reply assembly
// ---------------------------------------------------------------------------

struct EditState {
    buffer: String,
    message_id: Option<MessageId>,
    last_edit: Instant,
    failures: u32,
}

/// Accumulates text deltas into a progressively edited Telegram message.
pub struct StreamingReply {
    bot: Bot,
    chat_id: ChatId,
    reply_to: MessageId,
    thread: Option<ThreadId>,
    settings: StreamingConfig,
    state: Mutex<EditState>,
}

impl StreamingReply {
    fn new(
        bot: Bot,
        chat_id: ChatId,
        reply_to: MessageId,
        thread: Option<ThreadId>,
        settings: StreamingConfig,
    ) -> Self {
        Self {
            bot,
            chat_id,
            reply_to,
            thread,
            settings,
            state: Mutex::new(EditState {
                buffer: String::new(),
                message_id: None,
                last_edit: Instant::now(),
                failures: 0,
            }),
        }
    }

    /// Push the rolling buffer into the chat, creating the reply message
    /// on first flush and editing it afterwards.
    async fn flush(&self, state: &mut EditState) {
        if state.failures >= self.settings.max_edit_failures {
            return;
        }
        let mut preview = state.buffer.clone();
        if preview.len() > self.settings.max_chars {
            let boundary = (0..=self.settings.max_chars)
                .rev()
                .find(|i| preview.is_char_boundary(*i))
                .unwrap_or(0);
            preview.truncate(boundary);
        }
        if preview.trim().is_empty() {
            return;
        }

        match state.message_id {
            None => {
                let mut request = self
                    .bot
                    .send_message(self.chat_id, preview)
                    .reply_parameters(reply_params(self.reply_to));
                if let Some(thread_id) = self.thread {
                    request = request.message_thread_id(thread_id);
                }
                let sent = request.await;
                match sent {
                    Ok(message) => state.message_id = Some(message.id),
                    Err(err) => {
                        state.failures += 1;
                        debug!("Streamed send failed: {err}");
                    }
                }
            }
            Some(message_id) => {
                if let Err(err) = self
                    .bot
                    .edit_message_text(self.chat_id, message_id, preview)
                    .await
                {
                    state.failures += 1;
                    debug!("Streamed edit failed: {err}");
                }
            }
        }
        state.last_edit = Instant::now();
    }

    /// Replace the streamed preview with the final reply text.
    async fn finalize(&self, final_text: &str) {
        let mut state = self.state.lock().await;
        let message_id = state.message_id.take();
        drop(state);

        if final_text.trim().is_empty() {
            return;
        }
        match message_id {
            Some(message_id) if final_text.len() <= CHUNK_LIMIT => {
                if let Err(err) = self
                    .bot
                    .edit_message_text(self.chat_id, message_id, final_text)
                    .await
                {
                    debug!("Final edit failed, sending fresh: {err}");
                    send_text(&self.bot, self.chat_id, final_text, Some(self.reply_to), self.thread).await;
                }
            }
            Some(message_id) => {
                // Too long for one message: drop the preview, send chunks.
                let _ = self.bot.delete_message(self.chat_id, message_id).await;
                send_text(&self.bot, self.chat_id, final_text, Some(self.reply_to), self.thread).await;
            }
            None => {
                send_text(&self.bot, self.chat_id, final_text, Some(self.reply_to), self.thread).await;
            }
        }
    }
}

#[async_trait]
impl StreamSink for StreamingReply {
    async fn on_text_delta(&self, chunk: &str) {
        let mut state = self.state.lock().await;
        state.buffer.push_str(chunk);
        let due = state.last_edit.elapsed()
            >= Duration::from_secs_f64(self.settings.edit_interval_seconds);
        let ready = state.buffer.len() >= self.settings.min_chars;
        if ready && (due || state.message_id.is_none()) {
            self.flush(&mut state).await;
        }
    }

    async fn on_tool_activity(&self, tool_name: &str) {
        debug!("Tool activity: {tool_name}");
        let _ = self
            .bot
            .send_chat_action(self.chat_id, ChatAction::Typing)
            .await;
    }

    async fn on_system_status(&self, status: Option<&str>) {
        if let Some(status) = status {
            debug!("System status: {status}");
        }
        let _ = self
            .bot
            .send_chat_action(self.chat_id, ChatAction::Typing)
            .await;
    }
}

// ---------------------------------------------------------------------------
// Observer delivery
// ---------------------------------------------------------------------------

/// Delivers observer results to every allowed chat.
pub struct TelegramNotifier {
    bot: Bot,
    allowed_user_ids: Vec<i64>,
}

impl TelegramNotifier {
    pub fn new(bot: Bot, allowed_user_ids: Vec<i64>) -> Self {
        Self {
            bot,
            allowed_user_ids,
        }
    }

    async fn broadcast(&self, text: &str) {
        for chat_id in &self.allowed_user_ids {
            send_text(&self.bot, ChatId(*chat_id), text, None, None).await;
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn cron_result(&self, title: &str, text: &str, status: &str) {
        let body = if text.trim().is_empty() {
            format!("Cron '{title}' finished: {status}")
        } else {
            format!("Cron '{title}' ({status}):\n\n{text}")
        };
        self.broadcast(&body).await;
    }

    async fn webhook_result(&self, result: &WebhookResult) {
        // Wake mode already replied through the chat pipeline.
        if result.mode == "wake" {
            return;
        }
        let body = if result.result_text.trim().is_empty() {
            format!(
                "Webhook '{}' finished: {}",
                result.hook_title, result.status
            )
        } else {
            format!(
                "Webhook '{}' ({}):\n\n{}",
                result.hook_title, result.status, result.result_text
            )
        };
        self.broadcast(&body).await;
    }

    async fn heartbeat_alert(&self, chat_id: i64, text: &str) {
        send_text(&self.bot, ChatId(chat_id), text, None, None).await;
    }
}

/// Wake-mode webhook dispatch: behaves as if the user typed the prompt.
/// Acquires the chat lock so wakes queue behind active conversations.
pub struct TelegramWake {
    bot: Bot,
    gate: Arc<ChatGate>,
    orchestrator: Arc<Orchestrator>,
}

impl TelegramWake {
    pub fn new(bot: Bot, gate: Arc<ChatGate>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            bot,
            gate,
            orchestrator,
        }
    }
}

#[async_trait]
impl WakeHandler for TelegramWake {
    async fn wake(&self, chat_id: i64, prompt: &str) -> CoreResult<Option<String>> {
        let lock = self.gate.lock_for(chat_id);
        let _guard = lock.lock().await;
        let result = self.orchestrator.handle_message(chat_id, prompt).await;
        if result.text.trim().is_empty() {
            return Ok(None);
        }
        send_text(&self.bot, ChatId(chat_id), &result.text, None, None).await;
        Ok(Some(result.text))
    }
}

// ---------------------------------------------------------------------------
// Update handlers
// ---------------------------------------------------------------------------

fn is_allowed(state: &AppState, user_id: Option<i64>) -> bool {
    match user_id {
        Some(id) => state.config.allowed_user_ids.contains(&id),
        None => false,
    }
}

async fn on_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    // 1. Allowlist: silently drop everything else. No side effects.
    let user_id = msg.from.as_ref().map(|user| user.id.0 as i64);
    if !is_allowed(&state, user_id) {
        return Ok(());
    }
    let Some(text) = msg.text().map(str::to_string) else {
        return Ok(());
    };
    let chat_id = msg.chat.id;

    // 2. Abort triggers kill subprocesses and drain the queue before any
    // routing happens.
    if is_abort_message(&text) {
        debug!("Abort trigger detected text={:.40}", text);
        let killed = state.orchestrator.abort(chat_id.0).await;
        for indicator in state.gate.drain_pending(chat_id.0) {
            if let Some(indicator_id) = indicator {
                edit_indicator(&bot, chat_id, indicator_id, DISCARDED_INDICATOR).await;
            }
        }
        let reply = stop_text(killed > 0, &state.orchestrator.active_provider());
        send_text(&bot, chat_id, &reply, Some(msg.id), msg.thread_id).await;
        return Ok(());
    }

    // 3. Read-only commands bypass the lock. The model wizard refuses
    // while the agent is busy.
    if is_quick_command(&text) {
        debug!("Quick command bypass cmd={text}");
        let lowered = text.trim().to_lowercase();
        let first_word = lowered.split_whitespace().next().unwrap_or("");
        if first_word == "/model" && state.gate.is_busy(chat_id.0) {
            send_text(
                &bot,
                chat_id,
                "The agent is busy right now. Try /model again when the current call finishes.",
                Some(msg.id),
                msg.thread_id,
            )
            .await;
            return Ok(());
        }
        let result = state.orchestrator.handle_message(chat_id.0, &text).await;
        send_text(&bot, chat_id, &result.text, Some(msg.id), msg.thread_id).await;
        return Ok(());
    }

    // 4. Dedupe by (chat, message id).
    if state.gate.is_duplicate(chat_id.0, msg.id.0) {
        debug!("Message deduplicated msg_id={}", msg.id.0);
        return Ok(());
    }

    // 5. Per-chat lock with a visible queue.
    let lock = state.gate.lock_for(chat_id.0);
    let guard = match lock.try_lock() {
        Ok(guard) => guard,
        Err(_) => {
            let entry_id = state.gate.enqueue(chat_id.0, msg.id.0);
            let keyboard = InlineKeyboardMarkup::new([[InlineKeyboardButton::callback(
                "Cancel message",
                format!("{MQ_PREFIX}{entry_id}"),
            )]]);
            match bot
                .send_message(chat_id, QUEUE_INDICATOR)
                .reply_parameters(reply_params(msg.id))
                .reply_markup(keyboard)
                .await
            {
                Ok(sent) => state.gate.set_indicator(chat_id.0, entry_id, sent.id.0),
                Err(err) => debug!("Failed to send queue indicator: {err}"),
            }

            let guard = lock.lock().await;
            match state.gate.take_entry(chat_id.0, entry_id) {
                Some(entry) => {
                    if entry.cancelled {
                        // The cancel path already edited the indicator.
                        return Ok(());
                    }
                    if let Some(indicator_id) = entry.indicator_message_id {
                        if let Err(err) =
                            bot.delete_message(chat_id, MessageId(indicator_id)).await
                        {
                            debug!("Failed to delete queue indicator: {err}");
                        }
                    }
                }
                None => return Ok(()),
            }
            guard
        }
    };

    process_locked_message(&bot, &state, chat_id, msg.id, msg.thread_id, &text).await;
    drop(guard);
    Ok(())
}

/// Run the orchestrator under the held chat lock and deliver the reply.
async fn process_locked_message(
    bot: &Bot,
    state: &Arc<AppState>,
    chat_id: ChatId,
    origin: MessageId,
    thread: Option<ThreadId>,
    text: &str,
) {
    let _ = bot.send_chat_action(chat_id, ChatAction::Typing).await;

    if state.config.streaming.enabled {
        let reply = StreamingReply::new(
            bot.clone(),
            chat_id,
            origin,
            thread,
            state.config.streaming.clone(),
        );
        let result = state
            .orchestrator
            .handle_message_streaming(chat_id.0, text, &reply)
            .await;
        if result.stream_fallback {
            info!("Reply delivered via stream fallback");
        }
        reply.finalize(&result.text).await;
    } else {
        let result = state.orchestrator.handle_message(chat_id.0, text).await;
        send_text(bot, chat_id, &result.text, Some(origin), thread).await;
    }
}

async fn on_callback(bot: Bot, q: CallbackQuery, state: Arc<AppState>) -> ResponseResult<()> {
    if !is_allowed(&state, Some(q.from.id.0 as i64)) {
        return Ok(());
    }
    let Some(data) = q.data.clone() else {
        let _ = bot.answer_callback_query(q.id.clone()).await;
        return Ok(());
    };
    let Some(message) = q.message.as_ref() else {
        let _ = bot.answer_callback_query(q.id.clone()).await;
        return Ok(());
    };
    let chat_id = match message {
        MaybeInaccessibleMessage::Regular(message) => message.chat.id,
        MaybeInaccessibleMessage::Inaccessible(message) => message.chat.id,
    };

    if let Some(raw_id) = data.strip_prefix(MQ_PREFIX) {
        // Queue cancel buttons must work while the chat lock is held.
        if let Ok(entry_id) = raw_id.parse::<u64>() {
            if let Some(indicator) = state.gate.cancel_entry(chat_id.0, entry_id) {
                if let Some(indicator_id) = indicator {
                    edit_indicator(&bot, chat_id, indicator_id, CANCELLED_INDICATOR).await;
                }
            }
        }
        let _ = bot.answer_callback_query(q.id.clone()).await;
        return Ok(());
    }

    // Everything else preserves per-chat FIFO: take the lock, then route.
    let _ = bot.answer_callback_query(q.id.clone()).await;
    let lock = state.gate.lock_for(chat_id.0);
    let _guard = lock.lock().await;
    let result = state.orchestrator.handle_callback(chat_id.0, &data).await;
    send_text(&bot, chat_id, &result.text, None, None).await;
    Ok(())
}

/// Build and run the dispatcher until shutdown.
pub async fn run_dispatcher(state: Arc<AppState>) {
    let bot = state.bot.clone();
    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(on_message))
        .branch(Update::filter_callback_query().endpoint(on_callback));

    info!("Telegram dispatcher starting");
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .default_handler(|_| async {})
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
    info!("Telegram dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_respects_limit_and_preserves_content() {
        let short = chunk_text("hello");
        assert_eq!(short, vec!["hello".to_string()]);

        let long: String = (0..300)
            .map(|i| format!("line number {i} with some padding text\n"))
            .collect();
        let chunks = chunk_text(&long);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= CHUNK_LIMIT));
        assert_eq!(chunks.concat(), long);
    }

    #[test]
    fn chunking_splits_oversized_single_line() {
        let giant = "x".repeat(CHUNK_LIMIT * 2 + 17);
        let chunks = chunk_text(&giant);
        assert!(chunks.iter().all(|c| c.len() <= CHUNK_LIMIT));
        assert_eq!(chunks.concat(), giant);
    }
}

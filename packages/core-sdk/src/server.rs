use std::convert::Infallible;

use anyhow::Result;
use axum::{
    extract::{Path, Query},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, get_service, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::services::ServeDir;

use crate::models::{Character, Message};
use crate::{db, llm, telemetry};

/**
 * \brief 启动本地 HTTP 服务，提供静态前端与 API。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 */
pub async fn run(addr: &str) -> Result<()> {
    let ui_root =
        std::env::var("ROLECHAT_UI_DIR").unwrap_or_else(|_| "packages/ui/dist".to_string());
    let fallback_root =
        std::env::var("ROLECHAT_UI_FALLBACK").unwrap_or_else(|_| "web".to_string());

    let static_handler = if std::path::Path::new(&ui_root).exists() {
        ServeDir::new(ui_root)
    } else {
        ServeDir::new(fallback_root)
    }
    .append_index_html_on_directories(true);

    let static_service = get_service(static_handler);

    let app = Router::new()
        .route("/api/health", get(health_check))
        .route("/api/characters", get(get_characters).post(create_character))
        .route(
            "/api/characters/{id}",
            put(update_character).delete(delete_character),
        )
        .route(
            "/api/messages",
            get(get_messages)
                .post(create_message)
                .delete(destroy_messages),
        )
        .route(
            "/api/messages/{id}",
            put(update_message).delete(delete_message),
        )
        .route("/api/models", post(list_models_preview))
        .route("/api/chat/sse", get(chat_sse))
        .fallback_service(static_service);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Serialize, Deserialize, Debug)]
struct CharacterInput {
    /** \brief 角色名称 */
    name: String,
    /** \brief 系统提示词 */
    system_prompt: String,
    /** \brief Ollama 服务地址 */
    ollama_url: String,
    /** \brief Ollama API Key（可选） */
    #[serde(default)]
    ollama_api_key: Option<String>,
    /** \brief 模型名 */
    ollama_model: String,
}

#[derive(Serialize, Deserialize, Debug)]
struct MessageInput {
    /** \brief 消息正文 */
    content: String,
    /** \brief 发送者名称 */
    sender_name: String,
}

#[derive(Deserialize, Debug)]
struct ModelsPreviewRequest {
    /** \brief 待探测的 Ollama 服务地址（未保存的表单值） */
    ollama_url: String,
    #[serde(default)]
    ollama_api_key: Option<String>,
}

#[derive(Serialize, Debug)]
struct DestroyResponse {
    deleted: usize,
}

/**
 * \brief 健康检查，固定返回 "OK"。
 */
async fn health_check() -> &'static str {
    "OK"
}

fn validate_character(input: &CharacterInput) -> Result<(), (StatusCode, String)> {
    require_non_empty("name", &input.name)?;
    require_non_empty("system_prompt", &input.system_prompt)?;
    require_non_empty("ollama_url", &input.ollama_url)?;
    if let Some(key) = &input.ollama_api_key {
        require_non_empty("ollama_api_key", key)?;
    }
    require_non_empty("ollama_model", &input.ollama_model)?;
    Ok(())
}

fn validate_message(input: &MessageInput) -> Result<(), (StatusCode, String)> {
    require_non_empty("content", &input.content)?;
    require_non_empty("sender_name", &input.sender_name)?;
    Ok(())
}

/**
 * \brief 获取角色列表，按主键升序。
 */
async fn get_characters() -> Result<Json<Vec<Character>>, (StatusCode, String)> {
    let conn = db::open_default_db().map_err(internal_err)?;
    let characters = db::list_characters(&conn).map_err(internal_err)?;
    Ok(Json(characters))
}

/**
 * \brief 新增角色，返回创建后的记录。
 */
async fn create_character(
    Json(input): Json<CharacterInput>,
) -> Result<Json<Character>, (StatusCode, String)> {
    validate_character(&input)?;
    let conn = db::open_default_db().map_err(internal_err)?;
    let id = db::insert_character(
        &conn,
        &input.name,
        &input.system_prompt,
        &input.ollama_url,
        input.ollama_api_key.as_deref(),
        &input.ollama_model,
    )
    .map_err(internal_err)?;
    telemetry::log_event(
        "server.character",
        &format!("create id={} name={}", id, input.name),
    );
    let character = db::get_character_by_id(&conn, id)
        .map_err(internal_err)?
        .ok_or_else(|| not_found("Character not found"))?;
    Ok(Json(character))
}

/**
 * \brief 更新角色，返回更新后的记录；目标不存在时报 404。
 */
async fn update_character(
    Path(id): Path<i64>,
    Json(input): Json<CharacterInput>,
) -> Result<Json<Character>, (StatusCode, String)> {
    validate_character(&input)?;
    let conn = db::open_default_db().map_err(internal_err)?;
    let updated = db::update_character(
        &conn,
        id,
        &input.name,
        &input.system_prompt,
        &input.ollama_url,
        input.ollama_api_key.as_deref(),
        &input.ollama_model,
    )
    .map_err(internal_err)?;
    if !updated {
        return Err(not_found("Character not found"));
    }
    telemetry::log_event(
        "server.character",
        &format!("update id={} name={}", id, input.name),
    );
    let character = db::get_character_by_id(&conn, id)
        .map_err(internal_err)?
        .ok_or_else(|| not_found("Character not found"))?;
    Ok(Json(character))
}

/**
 * \brief 删除角色，返回被删除的记录；目标不存在时报 404。
 */
async fn delete_character(
    Path(id): Path<i64>,
) -> Result<Json<Character>, (StatusCode, String)> {
    let conn = db::open_default_db().map_err(internal_err)?;
    let character = db::take_character(&conn, id)
        .map_err(internal_err)?
        .ok_or_else(|| not_found("Character not found"))?;
    telemetry::log_event("server.character", &format!("delete id={}", id));
    Ok(Json(character))
}

/**
 * \brief 获取消息列表，最近更新在前。
 */
async fn get_messages() -> Result<Json<Vec<Message>>, (StatusCode, String)> {
    let conn = db::open_default_db().map_err(internal_err)?;
    let messages = db::list_messages(&conn).map_err(internal_err)?;
    Ok(Json(messages))
}

/**
 * \brief 新增消息，返回创建后的记录。
 */
async fn create_message(
    Json(input): Json<MessageInput>,
) -> Result<Json<Message>, (StatusCode, String)> {
    validate_message(&input)?;
    let conn = db::open_default_db().map_err(internal_err)?;
    let id = db::insert_message(&conn, &input.content, &input.sender_name).map_err(internal_err)?;
    let message = db::get_message_by_id(&conn, id)
        .map_err(internal_err)?
        .ok_or_else(|| not_found("Message not found"))?;
    Ok(Json(message))
}

/**
 * \brief 更新消息正文与发送者；目标不存在时报 404。
 */
async fn update_message(
    Path(id): Path<i64>,
    Json(input): Json<MessageInput>,
) -> Result<Json<Message>, (StatusCode, String)> {
    validate_message(&input)?;
    let conn = db::open_default_db().map_err(internal_err)?;
    let updated =
        db::update_message(&conn, id, &input.content, &input.sender_name).map_err(internal_err)?;
    if !updated {
        return Err(not_found("Message not found"));
    }
    let message = db::get_message_by_id(&conn, id)
        .map_err(internal_err)?
        .ok_or_else(|| not_found("Message not found"))?;
    Ok(Json(message))
}

/**
 * \brief 删除消息，返回被删除的记录；目标不存在时报 404。
 */
async fn delete_message(Path(id): Path<i64>) -> Result<Json<Message>, (StatusCode, String)> {
    let conn = db::open_default_db().map_err(internal_err)?;
    let message = db::take_message(&conn, id)
        .map_err(internal_err)?
        .ok_or_else(|| not_found("Message not found"))?;
    telemetry::log_event("server.chat", &format!("delete message id={}", id));
    Ok(Json(message))
}

/**
 * \brief 清空全部消息，返回删除条数。
 */
async fn destroy_messages() -> Result<Json<DestroyResponse>, (StatusCode, String)> {
    let conn = db::open_default_db().map_err(internal_err)?;
    let deleted = db::delete_all_messages(&conn).map_err(internal_err)?;
    telemetry::log_event("server.chat", &format!("destroy deleted={}", deleted));
    Ok(Json(DestroyResponse { deleted }))
}

/**
 * \brief 按未保存的端点配置探测可用模型，供角色编辑表单使用。
 */
async fn list_models_preview(
    Json(payload): Json<ModelsPreviewRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    require_non_empty("ollama_url", &payload.ollama_url)?;
    let models = llm::list_models(&payload.ollama_url, payload.ollama_api_key.as_deref())
        .await
        .map_err(internal_err)?;
    Ok(Json(serde_json::json!({ "models": models })))
}

#[derive(Deserialize, Debug)]
struct ChatQuery {
    /** \brief 角色 ID */
    character_id: i64,
    /** \brief 是否以流式返回（默认 true） */
    stream: Option<bool>,
    /** \brief 开启调试（默认 false），将推送 log 事件 */
    debug: Option<bool>,
}

/**
 * \brief 生成回复的 SSE 流接口：GET /api/chat/sse?character_id=...
 * \details 加载全部历史消息并构造提示词，逐段转发模型输出；生成结果不落库，
 *          由前端决定是否作为普通消息发送。
 */
async fn chat_sse(
    Query(q): Query<ChatQuery>,
) -> Result<
    Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>,
    (StatusCode, String),
> {
    let conn = db::open_default_db().map_err(internal_err)?;
    let telemetry_enabled = db::get_telemetry_enabled(&conn).map_err(internal_err)?;
    telemetry::set_enabled(telemetry_enabled);

    let character = db::get_character_by_id(&conn, q.character_id)
        .map_err(internal_err)?
        .ok_or_else(|| not_found("Character not found"))?;
    let history = db::load_history(&conn).map_err(internal_err)?;
    let messages = llm::build_history(&character, &history);

    let (tx, rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();

    let debug = q.debug.unwrap_or(false);
    let stream_flag = q.stream.unwrap_or(true);
    let history_len = history.len();

    tokio::spawn(async move {
        if debug {
            let _ = tx.send(Ok(Event::default().event("log").data(format!(
                "request -> character={} url={} model={} history={}",
                character.name, character.ollama_url, character.ollama_model, history_len
            ))));
        }

        telemetry::log_event(
            "server.generate",
            &format!(
                "character={}({}) model={} history={}",
                character.name, character.id, character.ollama_model, history_len
            ),
        );

        if stream_flag {
            match llm::stream_chat(&character, &messages).await {
                Ok(mut s) => {
                    use futures_util::StreamExt;
                    while let Some(item) = s.as_mut().next().await {
                        match item {
                            Ok(delta) => {
                                let _ = tx.send(Ok(Event::default().data(delta)));
                            }
                            Err(e) => {
                                telemetry::log_error(
                                    "server.generate",
                                    &format!("stream error: {}", e),
                                );
                                let _ = tx.send(Ok(Event::default()
                                    .event("error")
                                    .data(format!("{}", e))));
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    telemetry::log_error("server.generate", &format!("stream failed: {}", e));
                    let _ = tx.send(Ok(Event::default()
                        .event("error")
                        .data(format!("stream failed: {}", e))));
                }
            }
        } else {
            match llm::chat_once(&character, &messages).await {
                Ok(full) => {
                    let _ = tx.send(Ok(Event::default().data(full)));
                }
                Err(e) => {
                    telemetry::log_error("server.generate", &format!("chat_once failed: {}", e));
                    let _ = tx.send(Ok(Event::default().event("error").data(format!("{}", e))));
                }
            }
        }

        // EventSource 会在连接断开后自动重连，这里显式推送结束事件让前端主动关闭。
        let _ = tx.send(Ok(Event::default().event("done").data("")));
    });

    let stream = UnboundedReceiverStream::new(rx);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new()))
}

fn require_non_empty(field: &str, value: &str) -> Result<(), (StatusCode, String)> {
    if value.trim().is_empty() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("{} 不能为空", field),
        ));
    }
    Ok(())
}

fn internal_err<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn not_found(msg: &str) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, msg.to_string())
}

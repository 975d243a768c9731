use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{thread, time::Duration};
use time::{format_description::FormatItem, macros::format_description, OffsetDateTime};

use crate::models::{Character, Message};

/**
 * \brief 打开默认数据库文件（本地目录下的 rolechat.db）。
 */
pub fn open_default_db() -> Result<Connection> {
    let conn = Connection::open("rolechat.db")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS characters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name          TEXT NOT NULL,
            system_prompt TEXT NOT NULL,
            ollama_url    TEXT NOT NULL,
            ollama_api_key TEXT,
            ollama_model  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            content     TEXT NOT NULL,
            sender_name TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })?;
    Ok(())
}

// 固定 6 位小数秒，保证时间戳文本可按字典序比较排序。
const TIMESTAMP_FORMAT: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
);

/**
 * \brief 当前 UTC 时间的 RFC 3339 文本。
 */
pub fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&TIMESTAMP_FORMAT)
        .map_err(|e| anyhow!("format timestamp failed: {}", e))
}

fn set_bool_config(conn: &Connection, key: &str, value: bool) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, if value { "1" } else { "0" }],
        )
    })?;
    Ok(())
}

fn get_bool_config(conn: &Connection, key: &str, default: bool) -> Result<bool> {
    let val = conn
        .query_row(
            "SELECT value FROM app_config WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val.map(|s| s == "1").unwrap_or(default))
}

/**
 * \brief 读取遥测开关。
 */
pub fn get_telemetry_enabled(conn: &Connection) -> Result<bool> {
    get_bool_config(conn, "telemetry_enabled", false)
}

/**
 * \brief 更新遥测开关。
 */
pub fn set_telemetry_enabled(conn: &Connection, enabled: bool) -> Result<()> {
    set_bool_config(conn, "telemetry_enabled", enabled)
}

/**
 * \brief 新增角色，返回主键。
 */
pub fn insert_character(
    conn: &Connection,
    name: &str,
    system_prompt: &str,
    ollama_url: &str,
    ollama_api_key: Option<&str>,
    ollama_model: &str,
) -> Result<i64> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO characters (name, system_prompt, ollama_url, ollama_api_key, ollama_model)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, system_prompt, ollama_url, ollama_api_key, ollama_model],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 更新角色；目标不存在时返回 false。
 */
pub fn update_character(
    conn: &Connection,
    id: i64,
    name: &str,
    system_prompt: &str,
    ollama_url: &str,
    ollama_api_key: Option<&str>,
    ollama_model: &str,
) -> Result<bool> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE characters SET name=?1, system_prompt=?2, ollama_url=?3, ollama_api_key=?4, ollama_model=?5
             WHERE id=?6",
            params![name, system_prompt, ollama_url, ollama_api_key, ollama_model, id],
        )
    })?;
    Ok(rows > 0)
}

/**
 * \brief 删除角色；目标不存在时返回 false。
 */
pub fn delete_character(conn: &Connection, id: i64) -> Result<bool> {
    let rows = retry_on_locked(|| conn.execute("DELETE FROM characters WHERE id=?1", params![id]))?;
    Ok(rows > 0)
}

/**
 * \brief 删除角色并返回被删除的记录；目标不存在时返回 None。
 * \details 读取与删除之间行可能被并发清掉，以删除的实际行数为准。
 */
pub fn take_character(conn: &Connection, id: i64) -> Result<Option<Character>> {
    let Some(character) = get_character_by_id(conn, id)? else {
        return Ok(None);
    };
    if !delete_character(conn, id)? {
        return Ok(None);
    }
    Ok(Some(character))
}

fn map_character(row: &rusqlite::Row<'_>) -> rusqlite::Result<Character> {
    Ok(Character {
        id: row.get(0)?,
        name: row.get(1)?,
        system_prompt: row.get(2)?,
        ollama_url: row.get(3)?,
        ollama_api_key: row.get(4)?,
        ollama_model: row.get(5)?,
    })
}

/**
 * \brief 列出所有角色，按主键升序。
 */
pub fn list_characters(conn: &Connection) -> Result<Vec<Character>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, system_prompt, ollama_url, ollama_api_key, ollama_model
         FROM characters ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map([], map_character)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 按 ID 获取角色。
 */
pub fn get_character_by_id(conn: &Connection, id: i64) -> Result<Option<Character>> {
    conn.query_row(
        "SELECT id, name, system_prompt, ollama_url, ollama_api_key, ollama_model
         FROM characters WHERE id=?1",
        params![id],
        map_character,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 插入一条消息，创建与更新时间均取当前时刻。
 */
pub fn insert_message(conn: &Connection, content: &str, sender_name: &str) -> Result<i64> {
    let now = now_rfc3339()?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO messages (content, sender_name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![content, sender_name, now],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief 更新消息正文与发送者并刷新更新时间；目标不存在时返回 false。
 */
pub fn update_message(conn: &Connection, id: i64, content: &str, sender_name: &str) -> Result<bool> {
    let now = now_rfc3339()?;
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE messages SET content=?1, sender_name=?2, updated_at=?3 WHERE id=?4",
            params![content, sender_name, now, id],
        )
    })?;
    Ok(rows > 0)
}

/**
 * \brief 删除消息；目标不存在时返回 false。
 */
pub fn delete_message(conn: &Connection, id: i64) -> Result<bool> {
    let rows = retry_on_locked(|| conn.execute("DELETE FROM messages WHERE id=?1", params![id]))?;
    Ok(rows > 0)
}

/**
 * \brief 清空全部消息，返回删除条数。
 */
pub fn delete_all_messages(conn: &Connection) -> Result<usize> {
    let rows = retry_on_locked(|| conn.execute("DELETE FROM messages", []))?;
    Ok(rows)
}

/**
 * \brief 删除消息并返回被删除的记录；目标不存在时返回 None。
 */
pub fn take_message(conn: &Connection, id: i64) -> Result<Option<Message>> {
    let Some(message) = get_message_by_id(conn, id)? else {
        return Ok(None);
    };
    if !delete_message(conn, id)? {
        return Ok(None);
    }
    Ok(Some(message))
}

fn map_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        content: row.get(1)?,
        sender_name: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

/**
 * \brief 按 ID 获取消息。
 */
pub fn get_message_by_id(conn: &Connection, id: i64) -> Result<Option<Message>> {
    conn.query_row(
        "SELECT id, content, sender_name, created_at, updated_at FROM messages WHERE id=?1",
        params![id],
        map_message,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief 列出全部消息，最近更新在前（前端展示顺序）。
 */
pub fn list_messages(conn: &Connection) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT id, content, sender_name, created_at, updated_at
         FROM messages ORDER BY updated_at DESC, id DESC",
    )?;
    let rows = stmt
        .query_map([], map_message)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 按创建时间升序读取全部消息（提示词历史顺序）。
 */
pub fn load_history(conn: &Connection) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT id, content, sender_name, created_at, updated_at
         FROM messages ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt
        .query_map([], map_message)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并退避重试，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        migrate(&conn).expect("migrate");
        conn
    }

    fn sample_character(conn: &Connection, name: &str) -> i64 {
        insert_character(
            conn,
            name,
            "你是一个聊天机器人",
            "http://127.0.0.1:11434",
            Some("ollama"),
            "llama3",
        )
        .expect("insert character")
    }

    #[test]
    fn test_character_crud() {
        let conn = mem_conn();
        let id1 = sample_character(&conn, "小明");
        let id2 = sample_character(&conn, "小红");

        let list = list_characters(&conn).expect("list characters");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, id1);
        assert_eq!(list[1].id, id2);

        let updated = update_character(
            &conn,
            id1,
            "小明2",
            "新的提示词",
            "http://127.0.0.1:11434",
            None,
            "qwen3",
        )
        .expect("update character");
        assert!(updated);

        let one = get_character_by_id(&conn, id1)
            .expect("get by id")
            .expect("character exists");
        assert_eq!(one.name, "小明2");
        assert_eq!(one.system_prompt, "新的提示词");
        assert_eq!(one.ollama_api_key, None);
        assert_eq!(one.ollama_model, "qwen3");

        assert!(delete_character(&conn, id2).expect("delete character"));
        assert_eq!(list_characters(&conn).expect("list again").len(), 1);
    }

    #[test]
    fn test_character_update_delete_missing_returns_false() {
        let conn = mem_conn();
        let updated = update_character(
            &conn,
            999,
            "x",
            "y",
            "http://127.0.0.1:11434",
            None,
            "llama3",
        )
        .expect("update nonexistent");
        assert!(!updated);
        assert!(!delete_character(&conn, 999).expect("delete nonexistent"));
    }

    #[test]
    fn test_message_crud_and_timestamps() {
        let conn = mem_conn();
        let id = insert_message(&conn, "你好", "访客").expect("insert msg");
        let stored = get_message_by_id(&conn, id)
            .expect("get msg")
            .expect("msg exists");
        assert_eq!(stored.content, "你好");
        assert_eq!(stored.sender_name, "访客");
        assert_eq!(stored.created_at, stored.updated_at);

        // updated_at 刷新，created_at 保持不变。
        thread::sleep(Duration::from_millis(5));
        assert!(update_message(&conn, id, "改过了", "访客").expect("update msg"));
        let stored2 = get_message_by_id(&conn, id)
            .expect("get msg 2")
            .expect("msg exists");
        assert_eq!(stored2.content, "改过了");
        assert_eq!(stored2.created_at, stored.created_at);
        assert!(stored2.updated_at > stored.updated_at);

        assert!(delete_message(&conn, id).expect("delete msg"));
        assert!(!delete_message(&conn, id).expect("second delete reports missing"));
    }

    #[test]
    fn test_message_update_missing_returns_false() {
        let conn = mem_conn();
        assert!(!update_message(&conn, 42, "x", "y").expect("update nonexistent"));
    }

    #[test]
    fn test_list_messages_recent_update_first() {
        let conn = mem_conn();
        let first = insert_message(&conn, "一", "甲").expect("insert 1");
        thread::sleep(Duration::from_millis(5));
        let second = insert_message(&conn, "二", "乙").expect("insert 2");

        let list = list_messages(&conn).expect("list messages");
        assert_eq!(list[0].id, second);
        assert_eq!(list[1].id, first);

        // 更新旧消息后它应当排到最前。
        thread::sleep(Duration::from_millis(5));
        update_message(&conn, first, "一改", "甲").expect("update 1");
        let list = list_messages(&conn).expect("list messages 2");
        assert_eq!(list[0].id, first);
    }

    #[test]
    fn test_load_history_keeps_creation_order() {
        let conn = mem_conn();
        let first = insert_message(&conn, "一", "甲").expect("insert 1");
        thread::sleep(Duration::from_millis(5));
        let second = insert_message(&conn, "二", "乙").expect("insert 2");
        thread::sleep(Duration::from_millis(5));
        update_message(&conn, first, "一改", "甲").expect("update 1");

        let history = load_history(&conn).expect("load history");
        assert_eq!(history[0].id, first);
        assert_eq!(history[1].id, second);
    }

    #[test]
    fn test_delete_all_messages_empties_set() {
        let conn = mem_conn();
        insert_message(&conn, "一", "甲").expect("insert 1");
        insert_message(&conn, "二", "乙").expect("insert 2");
        insert_message(&conn, "三", "丙").expect("insert 3");

        let deleted = delete_all_messages(&conn).expect("destroy");
        assert_eq!(deleted, 3);
        assert!(list_messages(&conn).expect("list after destroy").is_empty());
        assert_eq!(delete_all_messages(&conn).expect("destroy empty"), 0);
    }

    #[test]
    fn test_take_character_removes_and_returns_row() {
        let conn = mem_conn();
        let id = sample_character(&conn, "小明");

        let taken = take_character(&conn, id)
            .expect("take character")
            .expect("row exists");
        assert_eq!(taken.name, "小明");
        assert!(get_character_by_id(&conn, id).expect("get after take").is_none());
        assert!(take_character(&conn, id).expect("second take").is_none());
    }

    #[test]
    fn test_take_message_removes_and_returns_row() {
        let conn = mem_conn();
        let id = insert_message(&conn, "你好", "访客").expect("insert msg");

        let taken = take_message(&conn, id)
            .expect("take message")
            .expect("row exists");
        assert_eq!(taken.content, "你好");
        assert!(take_message(&conn, id).expect("second take").is_none());
    }

    #[test]
    fn test_take_message_reports_missing_when_row_already_gone() {
        let conn = mem_conn();
        let id = insert_message(&conn, "你好", "访客").expect("insert msg");

        // 行在读取与删除之间被另一条连接清掉的情形。
        delete_message(&conn, id).expect("delete underneath");
        assert!(take_message(&conn, id).expect("take after delete").is_none());
    }

    #[test]
    fn test_telemetry_toggle_round_trip() {
        let conn = mem_conn();
        assert!(!get_telemetry_enabled(&conn).expect("default off"));
        set_telemetry_enabled(&conn, true).expect("enable");
        assert!(get_telemetry_enabled(&conn).expect("read back"));
        set_telemetry_enabled(&conn, false).expect("disable");
        assert!(!get_telemetry_enabled(&conn).expect("read back 2"));
    }
}

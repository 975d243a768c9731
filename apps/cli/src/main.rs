use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;

use rolechat_core_sdk::{db, llm, server, telemetry};

/**
 * \brief CLI 程序入口：本地角色聊天与服务管理。
 */
#[derive(Parser, Debug)]
#[command(name = "rolechat", version, about = "RoleChat character chat server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动本地 HTTP 服务并提供前端页面。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },

    /**
     * \brief 以指定发送者身份发送一条消息，并流式显示角色回复。
     * \details 终端场景没有后续编辑步骤，角色回复会直接以角色名落库。
     */
    Chat {
        #[arg(long)]
        character_id: i64,
        #[arg(long, default_value = "用户")]
        sender: String,
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value_t = false)]
        no_stream: bool,
    },

    /**
     * \brief 角色管理。
     */
    Characters {
        #[command(subcommand)]
        action: CharacterAction,
    },

    /**
     * \brief 读写遥测开关。
     */
    Telemetry {
        #[arg(long)]
        enabled: bool,
    },
}

#[derive(Subcommand, Debug)]
enum CharacterAction {
    /** \brief 列出全部角色。 */
    List,
    /** \brief 新增角色。 */
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        system_prompt: String,
        #[arg(long, default_value = "http://127.0.0.1:11434")]
        ollama_url: String,
        #[arg(long)]
        ollama_api_key: Option<String>,
        #[arg(long)]
        ollama_model: String,
    },
    /** \brief 删除角色。 */
    Rm {
        #[arg(long)]
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let conn = db::open_default_db().context("open database failed")?;
    db::migrate(&conn).context("apply migrations failed")?;
    let telemetry_enabled = db::get_telemetry_enabled(&conn).unwrap_or(false);
    telemetry::set_enabled(telemetry_enabled);

    match cli.command {
        Commands::Serve { addr } => {
            server::run(&addr).await?;
        }
        Commands::Chat {
            character_id,
            sender,
            prompt,
            no_stream,
        } => {
            let character = db::get_character_by_id(&conn, character_id)
                .context("load character failed")?
                .context("character not found, run: rolechat characters list")?;

            db::insert_message(&conn, &prompt, &sender).context("insert user message failed")?;

            let history = db::load_history(&conn).context("load messages failed")?;
            let messages = llm::build_history(&character, &history);

            telemetry::log_event(
                "cli.chat",
                &format!(
                    "character={}({}) sender={} prompt_len={}",
                    character.name,
                    character.id,
                    sender,
                    prompt.len()
                ),
            );

            let reply = if no_stream {
                let full = llm::chat_once(&character, &messages)
                    .await
                    .context("chat failed")?;
                println!("{}", full);
                full
            } else {
                let mut stream = llm::stream_chat(&character, &messages)
                    .await
                    .context("create stream failed")?;

                let mut reply_buf = String::new();
                while let Some(delta) = stream
                    .as_mut()
                    .next()
                    .await
                    .transpose()
                    .context("stream error")?
                {
                    print!("{}", delta);
                    reply_buf.push_str(&delta);
                    use std::io::Write;
                    std::io::stdout().flush().ok();
                }
                println!();
                reply_buf
            };

            if !reply.is_empty() {
                db::insert_message(&conn, &reply, &character.name)
                    .context("insert character reply failed")?;
            }
        }
        Commands::Characters { action } => match action {
            CharacterAction::List => {
                let characters = db::list_characters(&conn).context("list characters failed")?;
                if characters.is_empty() {
                    println!("No characters. Add one with: rolechat characters add --name ... --system-prompt ... --ollama-model ...");
                }
                for c in characters {
                    println!(
                        "{}\t{}\t{}\t{}",
                        c.id, c.name, c.ollama_model, c.ollama_url
                    );
                }
            }
            CharacterAction::Add {
                name,
                system_prompt,
                ollama_url,
                ollama_api_key,
                ollama_model,
            } => {
                let id = db::insert_character(
                    &conn,
                    &name,
                    &system_prompt,
                    &ollama_url,
                    ollama_api_key.as_deref(),
                    &ollama_model,
                )
                .context("save character failed")?;
                println!(
                    "Saved character id={} (name={} | {} | {})",
                    id, name, ollama_url, ollama_model
                );
            }
            CharacterAction::Rm { id } => {
                let deleted = db::delete_character(&conn, id).context("delete character failed")?;
                if deleted {
                    println!("Deleted character id={}", id);
                } else {
                    println!("Character id={} not found", id);
                }
            }
        },
        Commands::Telemetry { enabled } => {
            db::set_telemetry_enabled(&conn, enabled).context("save telemetry failed")?;
            telemetry::set_enabled(enabled);
            println!("Telemetry {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    Ok(())
}

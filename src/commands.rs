//! Line-oriented command syntax for the terminal host.

use anyhow::{Context, Result, anyhow, bail};
use quire_core::chat::{ChatKind, ChatTarget};
use quire_core::model::JobKind;
use quire_core::pagination::ColumnMode;
use quire_core::session::{Overlay, SessionCommand};

#[derive(Debug)]
pub enum Input {
    Command(SessionCommand),
    Quit,
}

pub const HELP: &str = "\
commands: snapshot | next | prev | next-para | prev-para | next-chapter | prev-chapter
  goto <chapter> [page] [paragraph] | seek <paragraph> | columns single|two
  viewport <width> <height> | play | pause | resume | stop | voice <name> [speed]
  rsvp start|pause|resume|stop | wpm <n>
  open recap|quiz|characters | open chat recap|character <id> | close
  illustrations on|off | generate recap|quiz|illustration | regenerate <prompt>
  accept | discard | dismiss | chat recap|character <id> <message> | retry recap|character <id>
  quit";

/// Parse one input line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<Input>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();
    let command = match verb {
        "quit" | "exit" => return Ok(Some(Input::Quit)),
        "help" => bail!("{HELP}"),
        "snapshot" => SessionCommand::GetSnapshot,
        "next" | "n" => SessionCommand::NextPage,
        "prev" | "p" => SessionCommand::PrevPage,
        "next-para" => SessionCommand::NextParagraph,
        "prev-para" => SessionCommand::PrevParagraph,
        "next-chapter" => SessionCommand::NextChapter,
        "prev-chapter" => SessionCommand::PrevChapter,
        "goto" => SessionCommand::GotoChapter {
            chapter: number(&args, 0, "chapter")?,
            page: optional_number(&args, 1, "page")?.unwrap_or(0),
            paragraph: optional_number(&args, 2, "paragraph")?.unwrap_or(0),
        },
        "seek" => SessionCommand::SeekParagraph {
            paragraph: number(&args, 0, "paragraph")?,
        },
        "columns" => SessionCommand::SetColumnMode {
            mode: match args.first().copied() {
                Some("single" | "1") => ColumnMode::Single,
                Some("two" | "2") => ColumnMode::TwoColumn,
                _ => bail!("usage: columns single|two"),
            },
        },
        "viewport" => SessionCommand::SetViewport {
            width: float(&args, 0, "width")?,
            height: float(&args, 1, "height")?,
        },
        "play" => SessionCommand::NarrationPlay,
        "pause" => SessionCommand::NarrationPause,
        "resume" => SessionCommand::NarrationResume,
        "stop" => SessionCommand::NarrationStop,
        "voice" => SessionCommand::SetVoice {
            voice: args
                .first()
                .map(|voice| voice.to_string())
                .ok_or_else(|| anyhow!("usage: voice <name> [speed]"))?,
            speed: if args.len() > 1 { float(&args, 1, "speed")? } else { 1.0 },
        },
        "rsvp" => match args.first().copied() {
            Some("start") => SessionCommand::SpeedReadingStart,
            Some("pause") => SessionCommand::SpeedReadingPause,
            Some("resume") => SessionCommand::SpeedReadingResume,
            Some("stop") => SessionCommand::SpeedReadingStop,
            _ => bail!("usage: rsvp start|pause|resume|stop"),
        },
        "wpm" => SessionCommand::SetWpm {
            wpm: number(&args, 0, "wpm")? as u32,
        },
        "open" => SessionCommand::OpenOverlay {
            overlay: match args.first().copied() {
                Some("recap") => Overlay::Recap,
                Some("quiz") => Overlay::Quiz,
                Some("characters") => Overlay::Characters,
                Some("chat") => Overlay::Chat {
                    target: chat_target(&args[1..])?,
                },
                _ => bail!("usage: open recap|quiz|characters|chat"),
            },
        },
        "close" => SessionCommand::CloseOverlay,
        "illustrations" => SessionCommand::SetIllustrationMode {
            enabled: match args.first().copied() {
                Some("on") => true,
                Some("off") => false,
                _ => bail!("usage: illustrations on|off"),
            },
        },
        "generate" => SessionCommand::RequestGeneration {
            kind: match args.first().copied() {
                Some("recap") => JobKind::Recap,
                Some("quiz") => JobKind::Quiz,
                Some("illustration") => JobKind::Illustration,
                _ => bail!("usage: generate recap|quiz|illustration"),
            },
        },
        "regenerate" => {
            if args.is_empty() {
                bail!("usage: regenerate <prompt>");
            }
            SessionCommand::RegenerateIllustration {
                parameter: args.join(" "),
            }
        }
        "accept" => SessionCommand::AcceptIllustration,
        "discard" => SessionCommand::DiscardIllustration,
        "dismiss" => SessionCommand::DismissToast,
        "chat" => {
            let target = chat_target(&args)?;
            let message = args.get(2..).unwrap_or_default().join(" ");
            if message.is_empty() {
                bail!("usage: chat recap|character <id> <message>");
            }
            SessionCommand::ChatSubmit { target, message }
        }
        "retry" => SessionCommand::ChatRetry {
            target: chat_target(&args)?,
        },
        other => bail!("unknown command `{other}`; try `help`"),
    };
    Ok(Some(Input::Command(command)))
}

fn chat_target(args: &[&str]) -> Result<ChatTarget> {
    let kind = match args.first().copied() {
        Some("recap") => ChatKind::Recap,
        Some("character") => ChatKind::Character,
        _ => bail!("expected chat kind recap|character"),
    };
    let id = args
        .get(1)
        .ok_or_else(|| anyhow!("expected a chapter or character id"))?;
    Ok(ChatTarget::new(kind, *id))
}

fn number(args: &[&str], index: usize, name: &str) -> Result<usize> {
    optional_number(args, index, name)?.ok_or_else(|| anyhow!("missing {name}"))
}

fn optional_number(args: &[&str], index: usize, name: &str) -> Result<Option<usize>> {
    args.get(index)
        .map(|raw| raw.parse::<usize>().with_context(|| format!("invalid {name} `{raw}`")))
        .transpose()
}

fn float(args: &[&str], index: usize, name: &str) -> Result<f32> {
    let raw = args.get(index).ok_or_else(|| anyhow!("missing {name}"))?;
    raw.parse::<f32>()
        .with_context(|| format!("invalid {name} `{raw}`"))
}

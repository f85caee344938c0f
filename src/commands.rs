//! Line commands for the terminal front end.

use std::str::FromStr;

use anyhow::{anyhow, bail, Error};

use crate::{controller::PresenceController, models::PresenceSnapshot};

pub const HELP: &str = "\
commands:
  start <classroom> [minutes]   open attendance (teacher)
  stop <classroom>              close attendance early (teacher)
  in <classroom>                punch in
  out <classroom>               punch out
  join <classroom>...           subscribe to classroom events
  msg <classroom> <text>        post a message to a classroom
  status                        show open windows and punch states
  help                          show this list
  quit                          exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start {
        classroom_id: String,
        minutes: Option<u32>,
    },
    Stop {
        classroom_id: String,
    },
    PunchIn {
        classroom_id: String,
    },
    PunchOut {
        classroom_id: String,
    },
    Join {
        classroom_ids: Vec<String>,
    },
    Message {
        classroom_id: String,
        message: String,
    },
    Status,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words
            .next()
            .ok_or_else(|| anyhow!("empty command"))?
            .to_ascii_lowercase();

        let mut classroom = |usage: &str| {
            words
                .next()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("usage: {usage}"))
        };

        let command = match verb.as_str() {
            "start" => {
                let classroom_id = classroom("start <classroom> [minutes]")?;
                let minutes = match words.next() {
                    Some(raw) => Some(
                        raw.parse::<u32>()
                            .map_err(|_| anyhow!("minutes must be a whole number, got '{raw}'"))?,
                    ),
                    None => None,
                };
                Command::Start {
                    classroom_id,
                    minutes,
                }
            }
            "stop" => Command::Stop {
                classroom_id: classroom("stop <classroom>")?,
            },
            "in" => Command::PunchIn {
                classroom_id: classroom("in <classroom>")?,
            },
            "out" => Command::PunchOut {
                classroom_id: classroom("out <classroom>")?,
            },
            "join" => {
                let classroom_ids: Vec<String> = words.by_ref().map(str::to_string).collect();
                if classroom_ids.is_empty() {
                    bail!("usage: join <classroom>...");
                }
                Command::Join { classroom_ids }
            }
            "msg" => {
                let classroom_id = classroom("msg <classroom> <text>")?;
                let message = words.by_ref().collect::<Vec<_>>().join(" ");
                if message.is_empty() {
                    bail!("usage: msg <classroom> <text>");
                }
                Command::Message {
                    classroom_id,
                    message,
                }
            }
            "status" => Command::Status,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => bail!("unknown command '{other}' (try 'help')"),
        };
        Ok(command)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    Quit,
}

pub async fn execute(controller: &PresenceController, command: Command) -> Result<Reply, String> {
    let text = match command {
        Command::Start {
            classroom_id,
            minutes,
        } => {
            let window = controller
                .start_attendance(&classroom_id, minutes)
                .await
                .map_err(|e| e.to_string())?;
            let remaining = controller
                .remaining_ms(&window.classroom_id)
                .await
                .unwrap_or_default();
            format!(
                "attendance open for {} ({})",
                window.classroom_id,
                format_remaining(remaining)
            )
        }
        Command::Stop { classroom_id } => {
            controller
                .stop_attendance(&classroom_id)
                .await
                .map_err(|e| e.to_string())?;
            format!("attendance closed for {classroom_id}")
        }
        Command::PunchIn { classroom_id } => {
            let receipt = controller
                .punch_in(&classroom_id)
                .await
                .map_err(|e| e.to_string())?;
            format!("punch-in sent for {} (awaiting confirmation)", receipt.classroom_id)
        }
        Command::PunchOut { classroom_id } => {
            let receipt = controller
                .punch_out(&classroom_id)
                .await
                .map_err(|e| e.to_string())?;
            format!("punch-out sent for {} (awaiting confirmation)", receipt.classroom_id)
        }
        Command::Join { classroom_ids } => {
            controller
                .join(&classroom_ids)
                .map_err(|e| e.to_string())?;
            format!("joined {}", classroom_ids.join(", "))
        }
        Command::Message {
            classroom_id,
            message,
        } => {
            controller
                .send_message(&classroom_id, &message)
                .map_err(|e| e.to_string())?;
            format!("message sent to {classroom_id}")
        }
        Command::Status => render_status(&controller.snapshot().await),
        Command::Help => HELP.to_string(),
        Command::Quit => return Ok(Reply::Quit),
    };
    Ok(Reply::Text(text))
}

fn render_status(snapshot: &PresenceSnapshot) -> String {
    if snapshot.windows.is_empty() && snapshot.statuses.is_empty() {
        return "no open attendance windows".to_string();
    }

    let mut lines = Vec::new();
    for window in &snapshot.windows {
        lines.push(format!(
            "{}  open  {}  punch: {}",
            window.classroom_id,
            format_remaining(window.remaining_ms),
            snapshot.status_of(&window.classroom_id).as_str()
        ));
    }
    for (classroom_id, status) in &snapshot.statuses {
        if snapshot.windows.iter().any(|w| &w.classroom_id == classroom_id) {
            continue;
        }
        lines.push(format!("{classroom_id}  closed  punch: {}", status.as_str()));
    }
    lines.join("\n")
}

fn format_remaining(remaining_ms: i64) -> String {
    let total_secs = remaining_ms.max(0) / 1_000;
    format!("{:02}:{:02} left", total_secs / 60, total_secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::{ClientEvent, ServerEvent},
        controller::loopback_controller,
        models::Role,
    };

    #[test]
    fn parses_every_verb() {
        assert_eq!(
            "start C1 10".parse::<Command>().unwrap(),
            Command::Start {
                classroom_id: "C1".into(),
                minutes: Some(10)
            }
        );
        assert_eq!(
            "START C1".parse::<Command>().unwrap(),
            Command::Start {
                classroom_id: "C1".into(),
                minutes: None
            }
        );
        assert_eq!(
            "join C1 C2".parse::<Command>().unwrap(),
            Command::Join {
                classroom_ids: vec!["C1".into(), "C2".into()]
            }
        );
        assert_eq!(
            "msg C1 see you  at 9".parse::<Command>().unwrap(),
            Command::Message {
                classroom_id: "C1".into(),
                message: "see you at 9".into()
            }
        );
        assert_eq!("status".parse::<Command>().unwrap(), Command::Status);
        assert_eq!("exit".parse::<Command>().unwrap(), Command::Quit);
    }

    #[test]
    fn bad_input_explains_usage() {
        assert!("".parse::<Command>().is_err());
        assert!("in".parse::<Command>().unwrap_err().to_string().contains("usage"));
        assert!("start C1 soon".parse::<Command>().is_err());
        assert!("dance".parse::<Command>().is_err());
        assert!("msg C1".parse::<Command>().is_err());
    }

    #[test]
    fn remaining_time_is_minutes_and_seconds() {
        assert_eq!(format_remaining(125_400), "02:05 left");
        assert_eq!(format_remaining(-5), "00:00 left");
    }

    #[tokio::test]
    async fn student_session_through_commands() {
        let (controller, mut peer, _clock) = loopback_controller(Role::Student);

        let err = execute(&controller, "in C1".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.contains("not open"));

        controller
            .dispatch(ServerEvent::SessionStarted {
                classroom_id: "C1".into(),
                duration_minutes: 2,
            })
            .await;

        let reply = execute(&controller, "in C1".parse().unwrap()).await.unwrap();
        assert_eq!(
            reply,
            Reply::Text("punch-in sent for C1 (awaiting confirmation)".into())
        );
        assert!(matches!(
            peer.sent().as_slice(),
            [ClientEvent::PunchIn { classroom_id, .. }] if classroom_id == "C1"
        ));

        let Reply::Text(status) = execute(&controller, Command::Status).await.unwrap() else {
            panic!("status should print text");
        };
        assert_eq!(status, "C1  open  02:00 left  punch: in");

        assert_eq!(
            execute(&controller, Command::Quit).await.unwrap(),
            Reply::Quit
        );
    }

    #[tokio::test]
    async fn teacher_commands_open_and_close() {
        let (controller, _peer, _clock) = loopback_controller(Role::Teacher);

        let reply = execute(&controller, "start C7 3".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(reply, Reply::Text("attendance open for C7 (03:00 left)".into()));

        let err = execute(&controller, "out C7".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.contains("teachers cannot punch"));

        let reply = execute(&controller, "stop C7".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(reply, Reply::Text("attendance closed for C7".into()));
        assert_eq!(
            execute(&controller, Command::Status).await.unwrap(),
            Reply::Text("no open attendance windows".into())
        );
    }
}

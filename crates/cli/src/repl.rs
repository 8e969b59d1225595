use std::io::{self, Write};
use std::time::Duration;

use ghost_core::io::{self as transport, OutputKind, OutputReceiver};
use ghost_core::runtime::Runtime;
use rustyline::error::ReadlineError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const SPINNER: [&str; 4] = ["-", "\\", "|", "/"];
const CONTEXT_ID: &str = "terminal";

enum InputEvent {
    Line(String),
    Interrupted,
    Eof,
    Error(String),
}

/// Line-oriented chat front end. Returns when the user quits or the token
/// is cancelled.
pub async fn run(
    runtime: &Runtime,
    mut output_rx: OutputReceiver,
    speaker: &str,
    token: CancellationToken,
    notice: Option<String>,
) -> anyhow::Result<()> {
    if let Some(notice) = notice {
        println!("{notice}");
    }
    println!("commands: /status, /quit");

    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<InputEvent>();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();
    spawn_input_thread(line_tx, ready_rx);
    request_next_prompt(&ready_tx);

    let mut pending = 0usize;
    let mut spinner_idx = 0usize;
    let mut spinner = tokio::time::interval(Duration::from_millis(100));
    spinner.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = spinner.tick(), if pending > 0 => {
                spinner_idx = (spinner_idx + 1) % SPINNER.len();
                draw_frame(SPINNER[spinner_idx])?;
            }
            line = line_rx.recv() => {
                let Some(line) = line else { break };
                match line {
                    InputEvent::Line(line) => {
                        let text = line.trim();
                        match text {
                            "" => request_next_prompt(&ready_tx),
                            "/q" | "/quit" | "/exit" => break,
                            "/status" => {
                                print_status(runtime).await;
                                request_next_prompt(&ready_tx);
                            }
                            _ => {
                                transport::submit(runtime.bus(), CONTEXT_ID, speaker, text);
                                pending += 1;
                                draw_frame(SPINNER[spinner_idx])?;
                            }
                        }
                    }
                    InputEvent::Interrupted => {
                        token.cancel();
                        break;
                    }
                    InputEvent::Eof => break,
                    InputEvent::Error(err) => {
                        eprintln!("input error: {err}");
                        break;
                    }
                }
            }
            msg = output_rx.recv() => {
                let Some(msg) = msg else { break };
                clear_line()?;
                match msg.kind {
                    OutputKind::Thinking => println!("({})", msg.content),
                    OutputKind::Reply | OutputKind::Fallback => {
                        println!("{}", msg.content);
                        pending = pending.saturating_sub(1);
                        if pending == 0 {
                            request_next_prompt(&ready_tx);
                        }
                    }
                }
            }
        }
    }
    drop(ready_tx);

    clear_line()?;
    println!();
    Ok(())
}

async fn print_status(runtime: &Runtime) {
    let report = runtime.health().await;
    let mood = runtime.affect().snapshot(CONTEXT_ID);
    println!(
        "model: {} ({}){}",
        report.cryostasis.phase,
        if report.inference_available { "reachable" } else { "unreachable" },
        report
            .cryostasis
            .operation_in_flight
            .map(|op| format!(", {} in progress", op.as_str()))
            .unwrap_or_default(),
    );
    println!(
        "mood: {} (p={:.2} a={:.2} d={:.2})",
        mood.describe(),
        mood.pleasure,
        mood.arousal,
        mood.dominance
    );
    println!(
        "tracked contexts: {} (active workers: {})",
        report.affect_contexts, report.context_workers
    );
}

fn draw_frame(frame: &str) -> anyhow::Result<()> {
    print!("\rthinking... {frame}");
    io::stdout().flush()?;
    Ok(())
}

fn clear_line() -> anyhow::Result<()> {
    print!("\r\x1b[2K");
    io::stdout().flush()?;
    Ok(())
}

fn request_next_prompt(ready_tx: &std::sync::mpsc::Sender<()>) {
    let _ = ready_tx.send(());
}

/// rustyline blocks, so it lives on its own thread and reads one line per
/// prompt request.
fn spawn_input_thread(line_tx: mpsc::UnboundedSender<InputEvent>, ready_rx: std::sync::mpsc::Receiver<()>) {
    std::thread::spawn(move || {
        let mut editor = match rustyline::DefaultEditor::new() {
            Ok(editor) => editor,
            Err(e) => {
                let _ = line_tx.send(InputEvent::Error(e.to_string()));
                return;
            }
        };

        while ready_rx.recv().is_ok() {
            let event = match editor.readline("you> ") {
                Ok(line) => {
                    let _ = editor.add_history_entry(line.as_str());
                    InputEvent::Line(line)
                }
                Err(ReadlineError::Interrupted) => InputEvent::Interrupted,
                Err(ReadlineError::Eof) => InputEvent::Eof,
                Err(e) => InputEvent::Error(e.to_string()),
            };
            let last = !matches!(event, InputEvent::Line(_));
            if line_tx.send(event).is_err() || last {
                break;
            }
        }
    });
}

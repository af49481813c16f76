use std::time::Instant;

use dialogue_tts::{AssemblyMode, DialogueLine, Session, SessionOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let session = Session::from_env()?;

    match session.list_voices().await {
        Ok(voices) => {
            let names: Vec<&str> = voices.iter().map(|v| v.filename.as_str()).collect();
            println!("Available voices: {names:?}");
        }
        Err(e) => println!("Could not list voices: {e}"),
    }

    let script = "DJ Cara: Good evening, and welcome back to the late show.\n\
                  Rick: Morty, get in the car. We're going on an adventure, and I need you \
                  to hold the portal gun steady this time.\n\
                  Morty: Aw geez, Rick. It's three in the morning!";
    let lines = DialogueLine::parse_script(script, "Narrator");

    let options = SessionOptions::builder()
        .title("Late Show")
        .persona_mode("DJ Cara")
        .mode(AssemblyMode::SingleTrack { label: None })
        .output_dir("audio")
        .bookend(true)
        .bridge_text("And now, back to the garage.")
        .build()?;

    let render_start = Instant::now();
    let output = session.render_session(&lines, &options).await?;
    let render_dur = render_start.elapsed();

    let audio_duration = output.record.total_duration_secs;
    println!(
        "Rendered {:.2}s of dialogue in {:.2?} ({:.1}x real-time)",
        audio_duration,
        render_dur,
        audio_duration / render_dur.as_secs_f64()
    );

    for line in &output.record.lines {
        let backends: Vec<String> = line
            .chunks
            .iter()
            .map(|c| c.backend.map_or("silence".to_string(), |b| b.to_string()))
            .collect();
        println!("  [{}] {}: {:?}", line.index, line.speaker, backends);
    }
    for track in &output.tracks {
        println!("Saved to {}", track.main.path.display());
        if let Some(bookended) = &track.bookended {
            println!("Saved to {}", bookended.path.display());
        }
    }
    Ok(())
}

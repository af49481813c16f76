//! Turning rendered lines into finished track files.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::{self, AudioClip, AudioFormat};
use crate::config::StingerDirs;
use crate::error::{AssemblyError, AudioError};
use crate::render::{LineAudio, RenderResult};

/// Appended to the stem of bookended copies.
pub const BOOKEND_SUFFIX: &str = "_with_intro_outro";

const STINGER_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "m4a", "flac"];
const MAX_NAME_LEN: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AssemblyMode {
    /// One file per speaker, speakers in order of first appearance.
    #[default]
    PerSpeaker,
    /// One file for the whole dialogue. Without a label the file is named
    /// after the speakers joined with `-`.
    SingleTrack { label: Option<String> },
}

/// Intro/outro clips to wrap around each output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stingers {
    pub intro: Option<PathBuf>,
    pub outro: Option<PathBuf>,
}

impl Stingers {
    pub fn is_empty(&self) -> bool {
        self.intro.is_none() && self.outro.is_none()
    }
}

impl StingerDirs {
    /// Find stinger files.
    ///
    /// Directories are tried in order: explicit intro/outro dirs, the shared
    /// dir, then `intro/` and `outro/` under `base`, and finally
    /// `intro_outros/` under `base` when nothing else matched. In a shared
    /// dir, files whose names mention `intro`/`outro` are preferred.
    pub fn pick(&self, base: &Path) -> Stingers {
        let mut shared = self.shared_dir.clone();
        let mut intro_dir = self
            .intro_dir
            .clone()
            .or_else(|| shared.clone())
            .unwrap_or_else(|| base.join("intro"));
        let mut outro_dir = self
            .outro_dir
            .clone()
            .or_else(|| shared.clone())
            .unwrap_or_else(|| base.join("outro"));

        let mut intro_files = list_audio_files(&intro_dir);
        let mut outro_files = list_audio_files(&outro_dir);

        if intro_files.is_empty() && outro_files.is_empty() {
            let guessed = base.join("intro_outros");
            if guessed.is_dir() {
                intro_dir = guessed.clone();
                outro_dir = guessed.clone();
                intro_files = list_audio_files(&guessed);
                outro_files = intro_files.clone();
                shared = Some(guessed);
            }
        }

        let unified = shared
            .as_ref()
            .is_some_and(|dir| *dir == intro_dir && *dir == outro_dir);
        if unified {
            return Stingers {
                intro: pick_hinted(&intro_files, "intro"),
                outro: pick_hinted(&outro_files, "outro"),
            };
        }
        Stingers {
            intro: intro_files.into_iter().next(),
            outro: outro_files.into_iter().next(),
        }
    }
}

fn pick_hinted(files: &[PathBuf], hint: &str) -> Option<PathBuf> {
    files
        .iter()
        .find(|f| {
            f.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.to_lowercase().contains(hint))
        })
        .or_else(|| files.first())
        .cloned()
}

fn list_audio_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| STINGER_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        })
        .collect();
    files.sort();
    files
}

/// Title and date parts of output file names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputNaming {
    pub title: String,
    /// Day and lowercase month followed by `_`, e.g. `16 oct_`.
    pub date_token: String,
}

impl OutputNaming {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            date_token: today_token(),
        }
    }

    pub fn with_date_token(mut self, token: impl Into<String>) -> Self {
        self.date_token = token.into();
        self
    }
}

pub fn today_token() -> String {
    let now = chrono::Local::now();
    format!("{} {}_", now.format("%d"), now.format("%b").to_string().to_lowercase())
}

/// Lowercase, keep `[a-z0-9-_.]`, spaces become `_`, at most 80 chars.
pub fn sanitize_filename(text: &str) -> String {
    let collapsed = text
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('/', "-");
    collapsed
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | ' ' | '_' | '.'))
        .map(|c| if c == ' ' { '_' } else { c })
        .take(MAX_NAME_LEN)
        .collect()
}

/// English ordinal: `1st`, `2nd`, `3rd`, `4th`, `11th`, `21st`.
pub fn ordinal(n: usize) -> String {
    let suffix = match (n % 10, n % 100) {
        (_, 11..=13) => "th",
        (1, _) => "st",
        (2, _) => "nd",
        (3, _) => "rd",
        _ => "th",
    };
    format!("{n}{suffix}")
}

/// One file written to disk.
#[derive(Debug, Clone)]
pub struct TrackFile {
    pub path: PathBuf,
    pub clip: AudioClip,
}

/// A finished output and, when stingers were applied, its bookended copy.
#[derive(Debug, Clone)]
pub struct Track {
    pub label: String,
    pub speakers: Vec<String>,
    pub line_indices: Vec<usize>,
    pub main: TrackFile,
    pub bookended: Option<TrackFile>,
}

pub struct AssemblyEngine {
    output_dir: PathBuf,
    crossfade: Duration,
}

impl AssemblyEngine {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            crossfade: Duration::ZERO,
        }
    }

    /// Crossfade applied between stinger parts.
    pub fn with_crossfade(mut self, crossfade: Duration) -> Self {
        self.crossfade = crossfade;
        self
    }

    pub fn assemble(
        &self,
        result: &RenderResult,
        mode: &AssemblyMode,
        naming: &OutputNaming,
        stingers: &Stingers,
        bridge: Option<&AudioClip>,
    ) -> Result<Vec<Track>, AssemblyError> {
        if result.lines.is_empty() {
            return Err(AssemblyError::EmptyResult);
        }
        let intro = stingers.intro.as_deref().map(load_stinger).transpose()?;
        let outro = stingers.outro.as_deref().map(load_stinger).transpose()?;
        let bookend = intro.is_some() || outro.is_some();

        fs::create_dir_all(&self.output_dir).map_err(|source| AssemblyError::Io {
            path: self.output_dir.clone(),
            source,
        })?;

        let title = match sanitize_filename(&naming.title) {
            t if t.is_empty() => "untitled".to_string(),
            t => t,
        };

        let mut tracks = Vec::new();
        for (label, lines) in group(result, mode) {
            let clips: Vec<&AudioClip> = lines.iter().map(|l| &l.clip).collect();
            let main_clip = audio::concat(&clips, Duration::ZERO)?;
            let path = self.next_path(&label, &title, &naming.date_token, main_clip.format);
            self.write(&path, &main_clip)?;
            log::info!(
                "Wrote {} ({} line(s), {:.1}s)",
                path.display(),
                lines.len(),
                main_clip.duration_secs()
            );

            let bookended = if bookend {
                let mut parts: Vec<&AudioClip> = Vec::with_capacity(4);
                parts.extend(intro.as_ref());
                parts.extend(bridge);
                parts.push(&main_clip);
                parts.extend(outro.as_ref());
                let clip = audio::concat(&parts, self.crossfade)?;
                let bookended_path = bookended_path(&path, clip.format);
                self.write(&bookended_path, &clip)?;
                log::info!("Wrote {}", bookended_path.display());
                Some(TrackFile {
                    path: bookended_path,
                    clip,
                })
            } else {
                None
            };

            let mut speakers: Vec<String> = Vec::new();
            for line in &lines {
                if !speakers.contains(&line.line.speaker) {
                    speakers.push(line.line.speaker.clone());
                }
            }
            tracks.push(Track {
                label,
                speakers,
                line_indices: lines.iter().map(|l| l.line.index).collect(),
                main: TrackFile {
                    path,
                    clip: main_clip,
                },
                bookended,
            });
        }
        Ok(tracks)
    }

    /// First free `<label>_<title>_<date><ordinal>.<ext>`.
    fn next_path(&self, label: &str, title: &str, date_token: &str, format: AudioFormat) -> PathBuf {
        let ext = format.extension();
        let prefix = format!("{label}_");
        let marker = format!("_{date_token}");
        let existing = fs::read_dir(&self.output_dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter_map(|e| e.file_name().to_str().map(str::to_string))
                    .filter(|name| {
                        name.starts_with(&prefix)
                            && name.contains(&marker)
                            && name.ends_with(&format!(".{ext}"))
                            && !name.contains(BOOKEND_SUFFIX)
                    })
                    .count()
            })
            .unwrap_or(0);

        let mut n = existing + 1;
        loop {
            let path = self
                .output_dir
                .join(format!("{label}_{title}_{date_token}{}.{ext}", ordinal(n)));
            if !path.exists() {
                return path;
            }
            n += 1;
        }
    }

    fn write(&self, path: &Path, clip: &AudioClip) -> Result<(), AssemblyError> {
        clip.write(path).map_err(|e| match e {
            AudioError::Io(source) => AssemblyError::Io {
                path: path.to_path_buf(),
                source,
            },
            other => AssemblyError::Audio(other),
        })
    }
}

fn bookended_path(path: &Path, format: AudioFormat) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}{BOOKEND_SUFFIX}.{}", format.extension()))
}

fn group<'r>(result: &'r RenderResult, mode: &AssemblyMode) -> Vec<(String, Vec<&'r LineAudio>)> {
    match mode {
        AssemblyMode::SingleTrack { label } => {
            let label = match label.as_deref().map(sanitize_filename) {
                Some(label) if !label.is_empty() => label,
                _ => {
                    let mut speakers: Vec<String> = Vec::new();
                    for line in &result.lines {
                        let name = speaker_label(&line.line.speaker);
                        if !speakers.contains(&name) {
                            speakers.push(name);
                        }
                    }
                    speakers.join("-")
                }
            };
            vec![(label, result.lines.iter().collect())]
        }
        AssemblyMode::PerSpeaker => {
            let mut groups: Vec<(&str, Vec<&LineAudio>)> = Vec::new();
            for line in &result.lines {
                let speaker = line.line.speaker.as_str();
                match groups.iter_mut().find(|(s, _)| *s == speaker) {
                    Some((_, lines)) => lines.push(line),
                    None => groups.push((speaker, vec![line])),
                }
            }

            // distinct speakers may sanitize to the same label
            let mut used: HashSet<String> = HashSet::new();
            groups
                .into_iter()
                .map(|(speaker, lines)| {
                    let base = speaker_label(speaker);
                    let mut label = base.clone();
                    let mut n = 2;
                    while !used.insert(label.clone()) {
                        label = format!("{base}-{n}");
                        n += 1;
                    }
                    (label, lines)
                })
                .collect()
        }
    }
}

/// Filename label for a speaker; `speaker` when nothing survives sanitizing.
fn speaker_label(speaker: &str) -> String {
    let label = sanitize_filename(speaker);
    if label.chars().any(|c| c.is_ascii_alphanumeric()) {
        label
    } else {
        "speaker".to_string()
    }
}

fn load_stinger(path: &Path) -> Result<AudioClip, AssemblyError> {
    let bytes = fs::read(path).map_err(|source| AssemblyError::StingerUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    AudioClip::from_bytes(bytes).map_err(|e| match e {
        AudioError::UnknownFormat(_) => AssemblyError::UnsupportedStinger {
            path: path.to_path_buf(),
        },
        other => AssemblyError::Audio(other),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::tests::{samples, tone};
    use crate::render::{ChunkInfo, DialogueLine};
    use tempfile::tempdir;

    fn line(index: usize, speaker: &str, value: i16) -> LineAudio {
        let clip = tone(value, 4, 8000);
        LineAudio {
            line: DialogueLine::new(index, speaker, "text"),
            duration: clip.duration,
            chunks: vec![ChunkInfo {
                index: 0,
                chars: 4,
                backend: None,
                remote_attempts: 0,
                duration: clip.duration,
                error: None,
            }],
            clip,
        }
    }

    fn dialogue() -> RenderResult {
        RenderResult {
            lines: vec![line(0, "Rick", 1), line(1, "Morty", 2), line(2, "Rick", 3)],
        }
    }

    fn naming() -> OutputNaming {
        OutputNaming::new("Portal Gun: Episode 1!").with_date_token("16 oct_")
    }

    #[test]
    fn single_track_concatenates_in_index_order() {
        let dir = tempdir().unwrap();
        let engine = AssemblyEngine::new(dir.path());
        let tracks = engine
            .assemble(
                &dialogue(),
                &AssemblyMode::SingleTrack { label: None },
                &naming(),
                &Stingers::default(),
                None,
            )
            .unwrap();

        assert_eq!(tracks.len(), 1);
        let track = &tracks[0];
        assert_eq!(track.label, "rick-morty");
        assert_eq!(track.line_indices, vec![0, 1, 2]);
        assert_eq!(
            samples(&track.main.clip),
            [vec![1; 4], vec![2; 4], vec![3; 4]].concat()
        );
        assert_eq!(
            track.main.path.file_name().unwrap().to_str().unwrap(),
            "rick-morty_portal_gun_episode_1_16 oct_1st.wav"
        );
        assert!(track.main.path.exists());
        assert!(track.bookended.is_none());
    }

    #[test]
    fn per_speaker_groups_by_first_appearance() {
        let dir = tempdir().unwrap();
        let engine = AssemblyEngine::new(dir.path());
        let tracks = engine
            .assemble(
                &dialogue(),
                &AssemblyMode::PerSpeaker,
                &naming(),
                &Stingers::default(),
                None,
            )
            .unwrap();

        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].label, "rick");
        assert_eq!(tracks[0].line_indices, vec![0, 2]);
        assert_eq!(samples(&tracks[0].main.clip), [vec![1; 4], vec![3; 4]].concat());
        assert_eq!(tracks[1].label, "morty");
        assert_eq!(tracks[1].line_indices, vec![1]);
    }

    #[test]
    fn colliding_speaker_names_get_separate_files() {
        let dir = tempdir().unwrap();
        let engine = AssemblyEngine::new(dir.path());
        let result = RenderResult {
            lines: vec![
                line(0, "李", 1),
                line(1, "王", 2),
                line(2, "Rick!", 3),
                line(3, "Rick", 4),
                line(4, "李", 5),
            ],
        };
        let tracks = engine
            .assemble(
                &result,
                &AssemblyMode::PerSpeaker,
                &naming(),
                &Stingers::default(),
                None,
            )
            .unwrap();

        let labels: Vec<&str> = tracks.iter().map(|t| t.label.as_str()).collect();
        assert_eq!(labels, ["speaker", "speaker-2", "rick", "rick-2"]);
        assert_eq!(tracks[0].speakers, ["李"]);
        assert_eq!(tracks[0].line_indices, vec![0, 4]);
        assert_eq!(tracks[1].speakers, ["王"]);
        assert_eq!(tracks[3].speakers, ["Rick"]);

        let mut paths: Vec<&PathBuf> = tracks.iter().map(|t| &t.main.path).collect();
        paths.dedup();
        assert_eq!(paths.len(), 4);
        assert!(tracks[0]
            .main
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("speaker_")));
    }

    #[test]
    fn ordinals_count_existing_outputs() {
        let dir = tempdir().unwrap();
        let engine = AssemblyEngine::new(dir.path());
        let mode = AssemblyMode::SingleTrack {
            label: Some("DJ Cara".to_string()),
        };
        let first = engine
            .assemble(&dialogue(), &mode, &naming(), &Stingers::default(), None)
            .unwrap();
        let second = engine
            .assemble(&dialogue(), &mode, &naming(), &Stingers::default(), None)
            .unwrap();

        let name = |t: &Track| t.main.path.file_name().unwrap().to_str().unwrap().to_string();
        assert_eq!(name(&first[0]), "dj_cara_portal_gun_episode_1_16 oct_1st.wav");
        assert_eq!(name(&second[0]), "dj_cara_portal_gun_episode_1_16 oct_2nd.wav");
    }

    #[test]
    fn intro_without_outro_wraps_only_the_front() {
        let dir = tempdir().unwrap();
        let intro_path = dir.path().join("intro.wav");
        tone(9, 10, 8000).write(&intro_path).unwrap();

        let engine = AssemblyEngine::new(dir.path().join("out"));
        let stingers = Stingers {
            intro: Some(intro_path),
            outro: None,
        };
        let tracks = engine
            .assemble(
                &dialogue(),
                &AssemblyMode::SingleTrack { label: None },
                &naming(),
                &stingers,
                None,
            )
            .unwrap();

        let bookended = tracks[0].bookended.as_ref().expect("bookended copy");
        let expected = [vec![9; 10], samples(&tracks[0].main.clip)].concat();
        assert_eq!(samples(&bookended.clip), expected);
        let name = bookended.path.file_name().unwrap().to_str().unwrap();
        assert!(name.ends_with("_1st_with_intro_outro.wav"));
        assert!(bookended.path.exists());
        assert!(tracks[0].main.path.exists());
    }

    #[test]
    fn bridge_goes_between_intro_and_main() {
        let dir = tempdir().unwrap();
        let intro_path = dir.path().join("intro.wav");
        let outro_path = dir.path().join("outro.wav");
        tone(9, 2, 8000).write(&intro_path).unwrap();
        tone(8, 2, 8000).write(&outro_path).unwrap();
        let bridge = tone(7, 2, 8000);

        let engine = AssemblyEngine::new(dir.path().join("out"));
        let stingers = Stingers {
            intro: Some(intro_path),
            outro: Some(outro_path),
        };
        let result = RenderResult {
            lines: vec![line(0, "Rick", 1)],
        };
        let tracks = engine
            .assemble(&result, &AssemblyMode::PerSpeaker, &naming(), &stingers, Some(&bridge))
            .unwrap();

        let bookended = tracks[0].bookended.as_ref().unwrap();
        assert_eq!(samples(&bookended.clip), vec![9, 9, 7, 7, 1, 1, 1, 1, 8, 8]);
    }

    #[test]
    fn unreadable_stinger_is_an_error() {
        let dir = tempdir().unwrap();
        let engine = AssemblyEngine::new(dir.path());
        let stingers = Stingers {
            intro: None,
            outro: Some(dir.path().join("missing.mp3")),
        };
        let err = engine
            .assemble(&dialogue(), &AssemblyMode::PerSpeaker, &naming(), &stingers, None)
            .unwrap_err();
        assert!(matches!(err, AssemblyError::StingerUnreadable { .. }));
    }

    #[test]
    fn unrecognized_stinger_is_an_error() {
        let dir = tempdir().unwrap();
        let bogus = dir.path().join("intro.mp3");
        fs::write(&bogus, b"definitely not audio").unwrap();
        let engine = AssemblyEngine::new(dir.path());
        let stingers = Stingers {
            intro: Some(bogus),
            outro: None,
        };
        let err = engine
            .assemble(&dialogue(), &AssemblyMode::PerSpeaker, &naming(), &stingers, None)
            .unwrap_err();
        assert!(matches!(err, AssemblyError::UnsupportedStinger { .. }));
    }

    #[cfg(not(feature = "transcode"))]
    #[test]
    fn mixing_formats_needs_transcoding() {
        let dir = tempdir().unwrap();
        let intro = dir.path().join("intro.mp3");
        fs::write(&intro, crate::audio::mp3::tests::frames(3)).unwrap();
        let engine = AssemblyEngine::new(dir.path().join("out"));
        let stingers = Stingers {
            intro: Some(intro),
            outro: None,
        };
        let err = engine
            .assemble(&dialogue(), &AssemblyMode::PerSpeaker, &naming(), &stingers, None)
            .unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::Audio(AudioError::FormatMismatch { .. })
        ));
    }

    #[test]
    fn empty_result_is_rejected() {
        let dir = tempdir().unwrap();
        let engine = AssemblyEngine::new(dir.path());
        let err = engine
            .assemble(
                &RenderResult::default(),
                &AssemblyMode::PerSpeaker,
                &naming(),
                &Stingers::default(),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, AssemblyError::EmptyResult));
    }

    #[test]
    fn picks_stingers_from_shared_dir_by_hint() {
        let dir = tempdir().unwrap();
        let shared = dir.path().join("stingers");
        fs::create_dir(&shared).unwrap();
        for name in ["a_theme.wav", "outro_theme.mp3", "the_intro.mp3", "notes.txt"] {
            fs::write(shared.join(name), b"x").unwrap();
        }
        let dirs = StingerDirs {
            shared_dir: Some(shared.clone()),
            ..Default::default()
        };
        let picked = dirs.pick(dir.path());
        assert_eq!(picked.intro, Some(shared.join("the_intro.mp3")));
        assert_eq!(picked.outro, Some(shared.join("outro_theme.mp3")));
    }

    #[test]
    fn picks_first_file_from_default_dirs() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("intro")).unwrap();
        fs::write(dir.path().join("intro").join("b.wav"), b"x").unwrap();
        fs::write(dir.path().join("intro").join("a.mp3"), b"x").unwrap();

        let picked = StingerDirs::default().pick(dir.path());
        assert_eq!(picked.intro, Some(dir.path().join("intro").join("a.mp3")));
        assert_eq!(picked.outro, None);
    }

    #[test]
    fn falls_back_to_intro_outros_dir() {
        let dir = tempdir().unwrap();
        let guessed = dir.path().join("intro_outros");
        fs::create_dir(&guessed).unwrap();
        fs::write(guessed.join("show_intro.wav"), b"x").unwrap();
        fs::write(guessed.join("show_outro.wav"), b"x").unwrap();

        let picked = StingerDirs::default().pick(dir.path());
        assert_eq!(picked.intro, Some(guessed.join("show_intro.wav")));
        assert_eq!(picked.outro, Some(guessed.join("show_outro.wav")));
    }

    #[test]
    fn nothing_found_means_no_stingers() {
        let dir = tempdir().unwrap();
        assert!(StingerDirs::default().pick(dir.path()).is_empty());
    }

    #[test]
    fn naming_helpers() {
        assert_eq!(sanitize_filename("  Rick & Morty / S1  "), "rick__morty_-_s1");
        assert_eq!(sanitize_filename(&"a".repeat(100)).len(), 80);
        assert_eq!(ordinal(1), "1st");
        assert_eq!(ordinal(2), "2nd");
        assert_eq!(ordinal(3), "3rd");
        assert_eq!(ordinal(4), "4th");
        assert_eq!(ordinal(11), "11th");
        assert_eq!(ordinal(12), "12th");
        assert_eq!(ordinal(21), "21st");
        assert_eq!(ordinal(112), "112th");
        let token = today_token();
        assert!(token.ends_with('_'));
        assert_eq!(token.len(), 7);
    }
}

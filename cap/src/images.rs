//! Image and audio artifact handling
//!
//! Artifacts live under `{root}/{session_id}/{phase_name}/` with
//! `image_{n}.{ext}` names (or `sounding_{s}_image_{n}.{ext}` inside a
//! sounding). Index allocation scans existing files so concurrent writers
//! renumber instead of overwriting. Base64 data-URLs move images in and out
//! of message content.

use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;

use crate::agent::{ChatMessage, ContentPart, MessageContent};
use crate::error::{CascadeError, Result};

/// Mime type by file extension, defaulting to PNG
fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "image/png",
    }
}

/// Extension implied by a data-URL mime, defaulting to png
pub fn extension_for_data_url(data_url: &str) -> &'static str {
    if data_url.starts_with("data:image/jpeg") {
        "jpg"
    } else if data_url.starts_with("data:image/gif") {
        "gif"
    } else if data_url.starts_with("data:image/webp") {
        "webp"
    } else {
        "png"
    }
}

/// Encode a stored image to a base64 data-URL
pub fn encode_image_base64(path: &Path) -> Result<String> {
    let bytes = fs::read(path)
        .map_err(|e| CascadeError::Infrastructure(format!("Image not found at {}: {}", path.display(), e)))?;
    Ok(format!("data:{};base64,{}", mime_for(path), BASE64.encode(bytes)))
}

/// Decode a data-URL (or bare base64) and save it, creating parent dirs
pub fn decode_and_save_image(data: &str, save_path: &Path) -> Result<PathBuf> {
    let payload = match data.split_once(",") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => data,
    };
    let bytes = BASE64
        .decode(payload.trim())
        .map_err(|e| CascadeError::Infrastructure(format!("Invalid base64 image data: {}", e)))?;

    if let Some(parent) = save_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| CascadeError::Infrastructure(format!("Cannot create {}: {}", parent.display(), e)))?;
    }
    fs::write(save_path, bytes)
        .map_err(|e| CascadeError::Infrastructure(format!("Cannot write {}: {}", save_path.display(), e)))?;
    Ok(save_path.to_path_buf())
}

/// Next free index for `image_{n}.{ext}` under a session/phase directory
///
/// With a sounding index, only `sounding_{s}_image_{n}` files count.
pub fn next_artifact_index(root: &Path, session_id: &str, phase_name: &str, kind: &str, sounding_index: Option<usize>) -> usize {
    let dir = root.join(session_id).join(phase_name);
    let Ok(entries) = fs::read_dir(&dir) else {
        return 0;
    };

    let pattern = match sounding_index {
        Some(s) => format!(r"^sounding_{}_{}_(\d+)\.\w+$", s, kind),
        None => format!(r"^{}_(\d+)\.\w+$", kind),
    };
    let Ok(re) = Regex::new(&pattern) else { return 0 };

    let mut max_index: Option<usize> = None;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(caps) = re.captures(name)
            && let Ok(idx) = caps[1].parse::<usize>()
        {
            max_index = Some(max_index.map_or(idx, |m: usize| m.max(idx)));
        }
    }
    max_index.map_or(0, |m| m + 1)
}

/// Standardized save path for an image artifact
pub fn image_save_path(
    root: &Path,
    session_id: &str,
    phase_name: &str,
    index: usize,
    extension: &str,
    sounding_index: Option<usize>,
) -> PathBuf {
    artifact_save_path(root, session_id, phase_name, "image", index, extension, sounding_index)
}

/// Standardized save path for an audio artifact
pub fn audio_save_path(
    root: &Path,
    session_id: &str,
    phase_name: &str,
    index: usize,
    extension: &str,
    sounding_index: Option<usize>,
) -> PathBuf {
    artifact_save_path(root, session_id, phase_name, "audio", index, extension, sounding_index)
}

fn artifact_save_path(
    root: &Path,
    session_id: &str,
    phase_name: &str,
    kind: &str,
    index: usize,
    extension: &str,
    sounding_index: Option<usize>,
) -> PathBuf {
    let filename = match sounding_index {
        Some(s) => format!("sounding_{}_{}_{}.{}", s, kind, index, extension),
        None => format!("{}_{}.{}", kind, index, extension),
    };
    root.join(session_id).join(phase_name).join(filename)
}

/// All stored image paths for a session/phase, sorted by name
pub fn list_phase_images(root: &Path, session_id: &str, phase_name: &str) -> Vec<PathBuf> {
    let dir = root.join(session_id).join(phase_name);
    let Ok(entries) = fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.contains("image_"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();
    paths
}

/// Drop all but the most recent N base64 images from message content
///
/// Counts from the end of the history; older image parts are removed
/// entirely rather than replaced with placeholder text.
pub fn cull_old_base64_images(messages: &mut [ChatMessage], keep_recent: usize) {
    let mut images_seen = 0;
    for message in messages.iter_mut().rev() {
        if let MessageContent::Parts(parts) = &mut message.content {
            // Walk parts in reverse so removal indexes stay valid
            let mut idx = parts.len();
            while idx > 0 {
                idx -= 1;
                let is_base64_image = matches!(
                    &parts[idx],
                    ContentPart::ImageUrl { image_url } if image_url.url.starts_with("data:")
                );
                if is_base64_image {
                    images_seen += 1;
                    if images_seen > keep_recent {
                        parts.remove(idx);
                    }
                }
            }
        }
    }
}

/// Keep only the most recent conversation turns
///
/// A turn is roughly three messages (user, assistant, tool). The tool
/// definition system message is re-pinned at the front if culling would
/// lose it, so the agent always knows its tools.
pub fn cull_history(messages: Vec<ChatMessage>, keep_recent_turns: usize) -> Vec<ChatMessage> {
    if keep_recent_turns == 0 {
        return messages;
    }
    let keep_count = keep_recent_turns * 3;
    if messages.len() <= keep_count {
        return messages;
    }

    let is_tool_system = |m: &ChatMessage| {
        m.role == crate::agent::Role::System && m.content.text_lossy().to_lowercase().contains("tool")
    };

    let last_tool_system = messages.iter().rev().find(|m| is_tool_system(m)).cloned();
    let mut kept: Vec<ChatMessage> = messages[messages.len() - keep_count..].to_vec();

    if !kept.iter().any(|m| is_tool_system(m))
        && let Some(tool_system) = last_tool_system
    {
        kept.insert(0, tool_system);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ImageUrl;

    fn data_url_message(count: usize) -> ChatMessage {
        let parts = (0..count)
            .map(|i| ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:image/png;base64,IMAGE{}", i),
                },
            })
            .collect();
        ChatMessage::user_parts(parts)
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pic.png");
        std::fs::write(&path, b"fake png bytes").unwrap();

        let data_url = encode_image_base64(&path).unwrap();
        assert!(data_url.starts_with("data:image/png;base64,"));

        let out = dir.path().join("nested").join("copy.png");
        decode_and_save_image(&data_url, &out).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"fake png bytes");
    }

    #[test]
    fn test_encode_missing_file_errors() {
        assert!(encode_image_base64(Path::new("/no/such/pic.png")).is_err());
    }

    #[test]
    fn test_next_index_scans_existing() {
        let dir = tempfile::tempdir().unwrap();
        let phase_dir = dir.path().join("sess").join("draft");
        std::fs::create_dir_all(&phase_dir).unwrap();
        std::fs::write(phase_dir.join("image_0.png"), b"x").unwrap();
        std::fs::write(phase_dir.join("image_3.png"), b"x").unwrap();
        std::fs::write(phase_dir.join("sounding_1_image_5.png"), b"x").unwrap();

        assert_eq!(next_artifact_index(dir.path(), "sess", "draft", "image", None), 4);
        assert_eq!(
            next_artifact_index(dir.path(), "sess", "draft", "image", Some(1)),
            6
        );
        assert_eq!(
            next_artifact_index(dir.path(), "sess", "draft", "image", Some(2)),
            0
        );
        assert_eq!(next_artifact_index(dir.path(), "missing", "draft", "image", None), 0);
    }

    #[test]
    fn test_save_paths() {
        let root = Path::new("/tmp/images");
        assert_eq!(
            image_save_path(root, "s", "p", 2, "png", None),
            PathBuf::from("/tmp/images/s/p/image_2.png")
        );
        assert_eq!(
            image_save_path(root, "s", "p", 0, "jpg", Some(1)),
            PathBuf::from("/tmp/images/s/p/sounding_1_image_0.jpg")
        );
        assert_eq!(
            audio_save_path(root, "s", "p", 0, "mp3", None),
            PathBuf::from("/tmp/images/s/p/audio_0.mp3")
        );
    }

    #[test]
    fn test_cull_images_keeps_most_recent() {
        let mut messages = vec![data_url_message(2), data_url_message(2)];
        cull_old_base64_images(&mut messages, 3);

        let count = |m: &ChatMessage| match &m.content {
            MessageContent::Parts(parts) => parts.len(),
            MessageContent::Text(_) => 0,
        };
        // 4 images, keep 3: the oldest message loses one
        assert_eq!(count(&messages[0]), 1);
        assert_eq!(count(&messages[1]), 2);
    }

    #[test]
    fn test_cull_history_keeps_tail() {
        let messages: Vec<ChatMessage> = (0..20).map(|i| ChatMessage::user(format!("m{}", i))).collect();
        let kept = cull_history(messages, 2);
        assert_eq!(kept.len(), 6);
        assert_eq!(kept[0].content.text_lossy(), "m14");
    }

    #[test]
    fn test_cull_history_repins_tool_definitions() {
        let mut messages = vec![ChatMessage::system("Tool definitions: search, run_sql")];
        messages.extend((0..20).map(|i| ChatMessage::user(format!("m{}", i))));

        let kept = cull_history(messages, 2);
        assert_eq!(kept.len(), 7);
        assert!(kept[0].content.text_lossy().contains("Tool definitions"));
    }

    #[test]
    fn test_cull_history_disabled() {
        let messages: Vec<ChatMessage> = (0..20).map(|i| ChatMessage::user(format!("m{}", i))).collect();
        assert_eq!(cull_history(messages, 0).len(), 20);
    }

    #[test]
    fn test_extension_for_data_url() {
        assert_eq!(extension_for_data_url("data:image/jpeg;base64,x"), "jpg");
        assert_eq!(extension_for_data_url("data:image/png;base64,x"), "png");
        assert_eq!(extension_for_data_url("garbage"), "png");
    }
}

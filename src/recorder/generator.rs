//! Turns a recorder's captured frames into a textual Lua script plus a
//! manifest, grounded on `ScriptGenerator.h`'s `AnalyzeTiming`/
//! `DetectKeyTransitions`/`BuildScript`/`GenerateManifest`.

use crate::recorder::RawFrameData;

#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub project_name: String,
    pub author: String,
    pub target_level: String,
    pub description: String,
    pub update_rate: f32,
    pub emit_comments: bool,
    pub emit_wait_calls: bool,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        GenerationOptions {
            project_name: "Generated_TAS".to_string(),
            author: "Recorder".to_string(),
            target_level: "Level_01".to_string(),
            description: "Auto-generated TAS script".to_string(),
            update_rate: 132.0,
            emit_comments: true,
            emit_wait_calls: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedProject {
    pub main_lua: String,
    pub manifest_lua: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Pressed,
    Released,
}

const KEY_NAMES: [&str; 8] = ["up", "down", "left", "right", "shift", "space", "q", "esc"];

fn key_bit(frame: &RawFrameData, index: usize) -> bool {
    match index {
        0 => frame.up,
        1 => frame.down,
        2 => frame.left,
        3 => frame.right,
        4 => frame.shift,
        5 => frame.space,
        6 => frame.q,
        7 => frame.esc,
        _ => unreachable!(),
    }
}

/// Compares frame `i` against frame `i - 1` (or an all-idle frame for
/// `i == 0`) and reports a transition for every key whose bit changed.
/// `RawFrameData` carries one sampled bit per key per tick, so a
/// press and release inside the same tick is indistinguishable from no
/// change at all; only genuine edges between consecutive frames surface
/// here.
fn detect_transitions(prev: Option<&RawFrameData>, current: &RawFrameData) -> Vec<(&'static str, Transition)> {
    let mut out = Vec::new();
    for (index, name) in KEY_NAMES.iter().enumerate() {
        let was = prev.map(|f| key_bit(f, index)).unwrap_or(false);
        let is = key_bit(current, index);
        match (was, is) {
            (false, true) => out.push((*name, Transition::Pressed)),
            (true, false) => out.push((*name, Transition::Released)),
            _ => {}
        }
    }
    out
}

/// Builds the `main.lua` body: explicit `tas.press`/`tas.release` calls
/// at exact ticks, with `tas.wait(n)` calls bridging the gaps between
/// transitions when `emit_wait_calls` is set.
pub fn generate_script(frames: &[RawFrameData], options: &GenerationOptions) -> GeneratedProject {
    let mut body = String::new();
    body.push_str("-- Generated by the TAS recorder. Do not hand-edit; re-record instead.\n");
    body.push_str(&format!("-- {}\n\n", options.description));
    body.push_str("function main()\n");

    let mut last_emitted_tick: u32 = 0;
    let mut prev: Option<&RawFrameData> = None;
    for frame in frames {
        let transitions = detect_transitions(prev, frame);
        if !transitions.is_empty() {
            if options.emit_wait_calls && frame.tick_index > last_emitted_tick {
                body.push_str(&format!(
                    "  tas.wait({})\n",
                    frame.tick_index - last_emitted_tick
                ));
            }
            if options.emit_comments {
                body.push_str(&format!("  -- tick {}\n", frame.tick_index));
            }
            for (key, transition) in &transitions {
                match transition {
                    Transition::Pressed => body.push_str(&format!("  tas.press(\"{key}\")\n")),
                    Transition::Released => body.push_str(&format!("  tas.release(\"{key}\")\n")),
                }
            }
            last_emitted_tick = frame.tick_index;
        }
        if options.emit_comments {
            for event in &frame.events {
                body.push_str(&format!(
                    "  -- event: {} ({})\n",
                    event.name, event.data
                ));
            }
        }
        prev = Some(frame);
    }
    body.push_str("end\n");

    let manifest = format!(
        "return {{\n  name = \"{}\",\n  author = \"{}\",\n  target_level = \"{}\",\n  entry_script = \"main.lua\",\n  update_rate = {},\n}}\n",
        options.project_name, options.author, options.target_level, options.update_rate
    );

    GeneratedProject {
        main_lua: body,
        manifest_lua: manifest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::GameEvent;

    fn frame(tick: u32, up: bool) -> RawFrameData {
        RawFrameData {
            tick_index: tick,
            up,
            ..Default::default()
        }
    }

    #[test]
    fn emits_press_and_release_at_exact_ticks() {
        let frames = vec![frame(0, true), frame(1, true), frame(2, false)];
        let options = GenerationOptions::default();
        let project = generate_script(&frames, &options);
        assert!(project.main_lua.contains("tas.press(\"up\")"));
        assert!(project.main_lua.contains("tas.release(\"up\")"));
        assert!(project.manifest_lua.contains("entry_script = \"main.lua\""));
    }

    #[test]
    fn press_is_detected_with_wait_calls_disabled() {
        let mut f = frame(5, false);
        f.space = true;
        let frames = vec![frame(0, false), f];
        let project = generate_script(&frames, &GenerationOptions {
            emit_wait_calls: false,
            ..Default::default()
        });
        assert!(project.main_lua.contains("tas.press(\"space\")"));
        assert!(!project.main_lua.contains("tas.wait"));
    }

    #[test]
    fn game_events_become_comments() {
        let mut f = frame(0, false);
        f.events.push(GameEvent { name: "checkpoint".into(), data: 1 });
        let project = generate_script(&[f], &GenerationOptions::default());
        assert!(project.main_lua.contains("event: checkpoint"));
    }
}

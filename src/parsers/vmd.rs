//! Decoder for the motion format.
//!
//! The file is a flat record stream: a header with the target model's name,
//! then count-prefixed sections of bone, morph, camera and lamp keyframes.
//! Records carry their track name inline and arrive in no particular order;
//! the decoder groups them into tracks and sorts each track by frame.

use crate::error::Error;
use crate::motion::{
    dedupe_last_wins, BoneKeyframe, CameraKeyframe, LampKeyframe, MorphKeyframe, MotionDocument,
};
use crate::parsers::{finish, primitive::fixed_text, primitive::vec3, primitive::vec4, Result, TextCodec};
use log::{debug, warn};
use nom::{
    bytes::complete::take,
    number::complete::{le_f32, le_u32, le_u8},
    Err,
};

const MAGIC: &str = "Vocaloid Motion Data 0002";
const LEGACY_MAGIC: &str = "Vocaloid Motion Data file";

/// Decodes a motion file into grouped, frame-sorted tracks.
pub fn decode_motion(input: &[u8]) -> std::result::Result<MotionDocument, Error> {
    finish(motion(input))
}

fn motion(input: &[u8]) -> Result<MotionDocument> {
    let (input, magic) = fixed_text(input, 30, TextCodec::ShiftJis)?;
    if magic != MAGIC {
        if magic == LEGACY_MAGIC {
            return Err(Err::Failure(Error::unsupported(
                "old-style motion file (pre-0002 header)",
            )));
        }
        return Err(Err::Failure(Error::unsupported(
            "unrecognized motion file magic",
        )));
    }
    let (input, model_name) = fixed_text(input, 20, TextCodec::ShiftJis)?;
    let mut doc = MotionDocument::new(model_name);

    let (input, count) = section_count(input, "bone keyframe", 111)?;
    let mut rest = input;
    for _ in 0..count {
        let (input, (name, key)) = bone_keyframe(rest)?;
        doc.bone_tracks.entry(name).or_insert_with(Vec::new).push(key);
        rest = input;
    }

    let (input, count) = section_count(rest, "morph keyframe", 23)?;
    let mut rest = input;
    for _ in 0..count {
        let (input, (name, key)) = morph_keyframe(rest)?;
        doc.morph_tracks.entry(name).or_insert_with(Vec::new).push(key);
        rest = input;
    }

    // The camera and lamp sections are missing from some very old files;
    // running out of input cleanly at a section boundary is fine.
    let mut rest = rest;
    if !rest.is_empty() {
        let (input, count) = section_count(rest, "camera keyframe", 61)?;
        rest = input;
        for _ in 0..count {
            let (input, key) = camera_keyframe(rest)?;
            doc.camera_track.push(key);
            rest = input;
        }
    }
    if !rest.is_empty() {
        let (input, count) = section_count(rest, "lamp keyframe", 28)?;
        rest = input;
        for _ in 0..count {
            let (input, key) = lamp_keyframe(rest)?;
            doc.lamp_track.push(key);
            rest = input;
        }
    }
    if !rest.is_empty() {
        // Self-shadow and per-bone IK toggle sections follow in newer files.
        debug!("ignoring {} trailing bytes of motion file", rest.len());
    }

    for (name, track) in doc.bone_tracks.iter_mut() {
        sort_track(name, track, |k| k.frame);
    }
    for (name, track) in doc.morph_tracks.iter_mut() {
        sort_track(name, track, |k| k.frame);
    }
    sort_track("camera", &mut doc.camera_track, |k| k.frame);
    sort_track("lamp", &mut doc.lamp_track, |k| k.frame);

    Ok((&[], doc))
}

/// Sorts a track by frame and collapses duplicate frames, the last record in
/// file order winning.
fn sort_track<T, K: Ord + Copy>(name: &str, track: &mut Vec<T>, key: impl Fn(&T) -> K) {
    track.sort_by_key(&key);
    let before = track.len();
    dedupe_last_wins(track, &key);
    if track.len() != before {
        warn!(
            "track {:?} had {} keyframes on duplicate frames, kept the last of each",
            name,
            before - track.len()
        );
    }
}

fn section_count<'a>(
    input: &'a [u8],
    section: &'static str,
    record_size: usize,
) -> Result<'a, u32> {
    let (input, count) = le_u32(input)?;
    if count as usize > input.len() / record_size {
        return Err(Err::Failure(Error::malformed(
            section,
            format!(
                "declared count {} exceeds remaining data ({} bytes)",
                count,
                input.len()
            ),
        )));
    }
    Ok((input, count))
}

fn bone_keyframe(input: &[u8]) -> Result<(String, BoneKeyframe)> {
    let (input, name) = fixed_text(input, 15, TextCodec::ShiftJis)?;
    let (input, frame) = le_u32(input)?;
    let (input, translation) = vec3(input)?;
    let (input, rotation) = vec4(input)?;
    let (input, interp) = take(64usize)(input)?;
    let mut interpolation = [0u8; 64];
    interpolation.copy_from_slice(interp);
    Ok((
        input,
        (
            name,
            BoneKeyframe {
                frame,
                translation,
                rotation,
                interpolation,
            },
        ),
    ))
}

fn morph_keyframe(input: &[u8]) -> Result<(String, MorphKeyframe)> {
    let (input, name) = fixed_text(input, 15, TextCodec::ShiftJis)?;
    let (input, frame) = le_u32(input)?;
    let (input, weight) = le_f32(input)?;
    Ok((input, (name, MorphKeyframe { frame, weight })))
}

fn camera_keyframe(input: &[u8]) -> Result<CameraKeyframe> {
    let (input, frame) = le_u32(input)?;
    let (input, distance) = le_f32(input)?;
    let (input, position) = vec3(input)?;
    let (input, rotation) = vec3(input)?;
    let (input, interp) = take(24usize)(input)?;
    let mut interpolation = [0u8; 24];
    interpolation.copy_from_slice(interp);
    let (input, fov) = le_u32(input)?;
    let (input, ortho) = le_u8(input)?;
    Ok((
        input,
        CameraKeyframe {
            frame,
            distance,
            position,
            rotation,
            interpolation,
            fov,
            perspective: ortho == 0,
        },
    ))
}

fn lamp_keyframe(input: &[u8]) -> Result<LampKeyframe> {
    let (input, frame) = le_u32(input)?;
    let (input, color) = vec3(input)?;
    let (input, direction) = vec3(input)?;
    Ok((
        input,
        LampKeyframe {
            frame,
            color,
            direction,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fx(Vec<u8>);

    impl Fx {
        fn header(model_name: &str) -> Self {
            let mut fx = Fx(Vec::new());
            fx.fixed(MAGIC, 30);
            fx.fixed(model_name, 20);
            fx
        }

        fn fixed(&mut self, s: &str, len: usize) {
            let mut field = s.as_bytes().to_vec();
            field.resize(len, 0);
            self.0.extend_from_slice(&field);
        }
        fn u32(&mut self, v: u32) {
            self.0.extend_from_slice(&v.to_le_bytes());
        }
        fn f32(&mut self, v: f32) {
            self.0.extend_from_slice(&v.to_le_bytes());
        }
        fn bone_key(&mut self, name: &str, frame: u32) {
            self.fixed(name, 15);
            self.u32(frame);
            for _ in 0..7 {
                self.f32(0.0);
            }
            self.0.extend_from_slice(&[0u8; 64]);
        }
    }

    #[test]
    fn legacy_header_is_unsupported() {
        let mut fx = Fx(Vec::new());
        fx.fixed(LEGACY_MAGIC, 30);
        fx.fixed("m", 10);
        let err = decode_motion(&fx.0).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat { .. }));
    }

    #[test]
    fn missing_trailing_sections_are_tolerated() {
        let mut fx = Fx::header("model");
        fx.u32(0); // no bone keyframes
        fx.u32(0); // no morph keyframes, then clean EOF
        let doc = decode_motion(&fx.0).unwrap();
        assert_eq!(doc.model_name, "model");
        assert!(doc.camera_track.is_empty());
    }

    #[test]
    fn records_group_into_tracks_in_first_seen_order() {
        let mut fx = Fx::header("model");
        fx.u32(3);
        fx.bone_key("b", 4);
        fx.bone_key("a", 0);
        fx.bone_key("b", 1);
        fx.u32(0);
        let doc = decode_motion(&fx.0).unwrap();
        let names: Vec<&String> = doc.bone_tracks.keys().collect();
        assert_eq!(names, ["b", "a"]);
        // Out-of-order frames within a track get sorted.
        let frames: Vec<u32> = doc.bone_tracks["b"].iter().map(|k| k.frame).collect();
        assert_eq!(frames, [1, 4]);
    }

    #[test]
    fn duplicate_frames_keep_the_last_record() {
        let mut fx = Fx::header("model");
        fx.u32(2);
        fx.fixed("a", 15);
        fx.u32(7);
        fx.f32(1.0);
        for _ in 0..6 {
            fx.f32(0.0);
        }
        fx.0.extend_from_slice(&[0u8; 64]);
        fx.fixed("a", 15);
        fx.u32(7);
        fx.f32(2.0);
        for _ in 0..6 {
            fx.f32(0.0);
        }
        fx.0.extend_from_slice(&[0u8; 64]);
        fx.u32(0);
        let doc = decode_motion(&fx.0).unwrap();
        assert_eq!(doc.bone_tracks["a"].len(), 1);
        assert_eq!(doc.bone_tracks["a"][0].translation[0], 2.0);
    }

    #[test]
    fn overlong_count_is_malformed() {
        let mut fx = Fx::header("model");
        fx.u32(1000);
        let err = decode_motion(&fx.0).unwrap_err();
        assert!(matches!(err, Error::MalformedSection { .. }));
    }
}

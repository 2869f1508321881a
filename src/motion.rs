//! In-memory motion document and the retargeting machinery around it.
//!
//! A motion file is a flat stream of keyframes addressed by bone or morph
//! name; the document groups them into per-name tracks instead, in the order
//! the names first appear in the stream, each track sorted by frame number.

use crate::error::Error;
use linked_hash_map::LinkedHashMap;
use log::warn;

/// A bone keyframe: a local-space translation, a rotation quaternion and the
/// Bézier interpolation block that shapes the segment leading into it.
#[derive(Debug, Clone, PartialEq)]
pub struct BoneKeyframe {
    pub frame: u32,
    pub translation: [f32; 3],
    /// Rotation quaternion, `[x, y, z, w]`.
    pub rotation: [f32; 4],
    /// Raw 64-byte interpolation block; see [`BoneKeyframe::curve`].
    pub interpolation: [u8; 64],
}

/// Interpolated channels of a bone keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    X,
    Y,
    Z,
    Rotation,
}

/// Control points of a cubic Bézier easing curve on a single channel,
/// each axis in the 0..=127 range. `(20, 20)` / `(107, 107)` is linear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Curve {
    pub p1: (u8, u8),
    pub p2: (u8, u8),
}

impl Curve {
    pub const LINEAR: Curve = Curve {
        p1: (20, 20),
        p2: (107, 107),
    };

    pub fn is_linear(self) -> bool {
        self == Curve::LINEAR
    }
}

impl BoneKeyframe {
    pub fn new(frame: u32) -> Self {
        let mut interpolation = [0u8; 64];
        for channel in [Channel::X, Channel::Y, Channel::Z, Channel::Rotation] {
            write_curve(&mut interpolation, channel, Curve::LINEAR);
        }
        BoneKeyframe {
            frame,
            translation: [0.0; 3],
            rotation: [0.0, 0.0, 0.0, 1.0],
            interpolation,
        }
    }

    /// Reads the easing curve of one channel out of the interpolation block.
    pub fn curve(&self, channel: Channel) -> Curve {
        let i = channel as usize;
        Curve {
            p1: (self.interpolation[i], self.interpolation[i + 4]),
            p2: (self.interpolation[i + 8], self.interpolation[i + 12]),
        }
    }

    pub fn set_curve(&mut self, channel: Channel, curve: Curve) {
        write_curve(&mut self.interpolation, channel, curve);
    }
}

fn write_curve(block: &mut [u8; 64], channel: Channel, curve: Curve) {
    let i = channel as usize;
    block[i] = curve.p1.0;
    block[i + 4] = curve.p1.1;
    block[i + 8] = curve.p2.0;
    block[i + 12] = curve.p2.1;
}

#[derive(Debug, Clone, PartialEq)]
pub struct MorphKeyframe {
    pub frame: u32,
    pub weight: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraKeyframe {
    pub frame: u32,
    /// Distance from the interest point; negative in front of it.
    pub distance: f32,
    pub position: [f32; 3],
    /// Euler angles in radians.
    pub rotation: [f32; 3],
    pub interpolation: [u8; 24],
    pub fov: u32,
    pub perspective: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LampKeyframe {
    pub frame: u32,
    pub color: [f32; 3],
    pub direction: [f32; 3],
}

/// Maps bone names from the file's naming convention to the target
/// armature's. Returning `None` marks the track as unmapped; what happens
/// then is the caller's choice (see [`MotionDocument::retargeted`]).
pub trait BoneMapper {
    fn resolve(&self, name: &str) -> Option<String>;
}

/// A decoded motion file: named bone and morph tracks plus the unnamed
/// camera and lamp tracks. Track iteration order is the order the names
/// first appeared in the file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MotionDocument {
    /// Name of the model the motion was authored against. Empty for camera
    /// distributions.
    pub model_name: String,
    pub bone_tracks: LinkedHashMap<String, Vec<BoneKeyframe>>,
    pub morph_tracks: LinkedHashMap<String, Vec<MorphKeyframe>>,
    pub camera_track: Vec<CameraKeyframe>,
    pub lamp_track: Vec<LampKeyframe>,
}

impl MotionDocument {
    pub fn new(model_name: impl Into<String>) -> Self {
        MotionDocument {
            model_name: model_name.into(),
            ..MotionDocument::default()
        }
    }

    /// Highest frame number across all tracks, or 0 for an empty document.
    pub fn max_frame(&self) -> u32 {
        let bone = self
            .bone_tracks
            .values()
            .flat_map(|t| t.iter().map(|k| k.frame));
        let morph = self
            .morph_tracks
            .values()
            .flat_map(|t| t.iter().map(|k| k.frame));
        let camera = self.camera_track.iter().map(|k| k.frame);
        let lamp = self.lamp_track.iter().map(|k| k.frame);
        bone.chain(morph).chain(camera).chain(lamp).max().unwrap_or(0)
    }

    /// Looks up the keyframe of a bone track at an exact frame. Tracks are
    /// sorted by frame, so this is a binary search.
    pub fn bone_keyframe(&self, track: &str, frame: u32) -> Option<&BoneKeyframe> {
        let track = self.bone_tracks.get(track)?;
        let at = track.binary_search_by_key(&frame, |k| k.frame).ok()?;
        Some(&track[at])
    }

    /// Applies a uniform scale to every positional quantity: bone and camera
    /// translations and the camera distance. Rotations, morph weights and
    /// easing curves are untouched.
    pub fn scaled(mut self, factor: f32) -> Self {
        for (_, track) in self.bone_tracks.iter_mut() {
            for key in track {
                key.translation[0] *= factor;
                key.translation[1] *= factor;
                key.translation[2] *= factor;
            }
        }
        for key in &mut self.camera_track {
            key.distance *= factor;
            key.position[0] *= factor;
            key.position[1] *= factor;
            key.position[2] *= factor;
        }
        self
    }

    /// Delays every keyframe by `margin` frames, leaving room for a bind-pose
    /// frame at the start of the timeline.
    pub fn shifted(mut self, margin: u32) -> Self {
        if margin == 0 {
            return self;
        }
        for (_, track) in self.bone_tracks.iter_mut() {
            for key in track {
                key.frame += margin;
            }
        }
        for (_, track) in self.morph_tracks.iter_mut() {
            for key in track {
                key.frame += margin;
            }
        }
        for key in &mut self.camera_track {
            key.frame += margin;
        }
        for key in &mut self.lamp_track {
            key.frame += margin;
        }
        self
    }

    /// Renames every bone track through a [`BoneMapper`].
    ///
    /// With `strict` set, an unmapped track name aborts with
    /// [`Error::UnresolvedReference`]; otherwise the track is dropped with a
    /// warning. When two source tracks map to the same target name their
    /// keyframes are merged and re-sorted, later source tracks winning on
    /// frame collisions.
    pub fn retargeted(mut self, mapper: &dyn BoneMapper, strict: bool) -> Result<Self, Error> {
        let mut renamed: LinkedHashMap<String, Vec<BoneKeyframe>> = LinkedHashMap::new();
        for (name, track) in std::mem::take(&mut self.bone_tracks) {
            let target = match mapper.resolve(&name) {
                Some(target) => target,
                None if strict => return Err(Error::UnresolvedReference { name }),
                None => {
                    warn!("dropping bone track {:?}: no mapping", name);
                    continue;
                }
            };
            match renamed.entry(target) {
                linked_hash_map::Entry::Vacant(slot) => {
                    slot.insert(track);
                }
                linked_hash_map::Entry::Occupied(mut slot) => {
                    let merged = slot.get_mut();
                    merged.extend(track);
                    merged.sort_by_key(|k| k.frame);
                    dedupe_last_wins(merged, |k| k.frame);
                }
            }
        }
        self.bone_tracks = renamed;
        Ok(self)
    }
}

/// Keeps the last element of every run with equal keys. The stdlib
/// `dedup_by` keeps the first, which is the wrong way round for keyframe
/// streams where a later record overrides an earlier one.
pub(crate) fn dedupe_last_wins<T, K: PartialEq>(items: &mut Vec<T>, key: impl Fn(&T) -> K) {
    let mut write = 0;
    for read in 0..items.len() {
        if read + 1 < items.len() && key(&items[read]) == key(&items[read + 1]) {
            continue;
        }
        items.swap(write, read);
        write += 1;
    }
    items.truncate(write);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(frame: u32, y: f32) -> BoneKeyframe {
        let mut k = BoneKeyframe::new(frame);
        k.translation = [0.0, y, 0.0];
        k
    }

    struct Suffixer;
    impl BoneMapper for Suffixer {
        fn resolve(&self, name: &str) -> Option<String> {
            (name != "unknown").then(|| format!("{}_t", name))
        }
    }

    #[test]
    fn max_frame_spans_all_tracks() {
        let mut doc = MotionDocument::new("m");
        doc.bone_tracks.insert("a".into(), vec![key(3, 0.0)]);
        doc.morph_tracks.insert(
            "smile".into(),
            vec![MorphKeyframe {
                frame: 9,
                weight: 1.0,
            }],
        );
        assert_eq!(doc.max_frame(), 9);
        assert_eq!(MotionDocument::new("").max_frame(), 0);
    }

    #[test]
    fn shifted_moves_every_track() {
        let mut doc = MotionDocument::new("m");
        doc.bone_tracks.insert("a".into(), vec![key(0, 0.0)]);
        doc.lamp_track.push(LampKeyframe {
            frame: 2,
            color: [1.0; 3],
            direction: [0.0, -1.0, 0.0],
        });
        let doc = doc.shifted(5);
        assert_eq!(doc.bone_tracks["a"][0].frame, 5);
        assert_eq!(doc.lamp_track[0].frame, 7);
    }

    #[test]
    fn scaled_leaves_rotation_alone() {
        let mut doc = MotionDocument::new("m");
        let mut k = key(0, 2.0);
        k.rotation = [0.0, 0.7, 0.0, 0.7];
        doc.bone_tracks.insert("a".into(), vec![k]);
        let doc = doc.scaled(0.5);
        assert_eq!(doc.bone_tracks["a"][0].translation[1], 1.0);
        assert_eq!(doc.bone_tracks["a"][0].rotation, [0.0, 0.7, 0.0, 0.7]);
    }

    #[test]
    fn strict_retarget_fails_on_unknown_track() {
        let mut doc = MotionDocument::new("m");
        doc.bone_tracks.insert("unknown".into(), vec![key(0, 0.0)]);
        let err = doc.retargeted(&Suffixer, true).unwrap_err();
        assert!(matches!(err, Error::UnresolvedReference { name } if name == "unknown"));
    }

    #[test]
    fn lenient_retarget_drops_unknown_track() {
        let mut doc = MotionDocument::new("m");
        doc.bone_tracks.insert("unknown".into(), vec![key(0, 0.0)]);
        doc.bone_tracks.insert("arm".into(), vec![key(0, 0.0)]);
        let doc = doc.retargeted(&Suffixer, false).unwrap();
        assert_eq!(doc.bone_tracks.len(), 1);
        assert!(doc.bone_tracks.contains_key("arm_t"));
    }

    #[test]
    fn curve_roundtrips_through_block() {
        let mut k = BoneKeyframe::new(0);
        assert!(k.curve(Channel::Rotation).is_linear());
        let ease = Curve {
            p1: (40, 10),
            p2: (90, 120),
        };
        k.set_curve(Channel::Y, ease);
        assert_eq!(k.curve(Channel::Y), ease);
        assert!(k.curve(Channel::X).is_linear());
    }

    #[test]
    fn dedupe_keeps_last_of_run() {
        let mut items = vec![(0, 'a'), (1, 'b'), (1, 'c'), (2, 'd')];
        dedupe_last_wins(&mut items, |&(f, _)| f);
        assert_eq!(items, vec![(0, 'a'), (1, 'c'), (2, 'd')]);
    }
}

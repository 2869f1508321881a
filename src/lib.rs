//! `mmdio` is a parser and writer for the file family used by the
//! MikuMikuDance ecosystem: PMX models, legacy PMD models and VMD motions.
//!
//! The crate is split along one hard line: the codecs (`parsers`, `writers`
//! and the two document models) are pure functions over byte slices, while
//! everything that touches the filesystem or applies host policy (unit
//! scaling defaults, bone renaming, texture copying) lives in [`runtime`].
//!
//! # Reading a model
//!
//! ```no_run
//! let bytes = std::fs::read("miku.pmx")?;
//! let model = mmdio::decode_model(&bytes)?;
//!
//! for bone in &model.bones {
//!     println!("{} (parent: {:?})", bone.name, bone.parent);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! The same entry point reads legacy PMD files; the variant is detected from
//! the magic and a PMD file decodes into the same [`ModelDocument`], with the
//! legacy bone and morph tables normalized on the way in. The header records
//! which variant the document came from.
//!
//! # Writing a model
//!
//! ```no_run
//! # let bytes = std::fs::read("miku.pmx")?;
//! let model = mmdio::decode_model(&bytes)?;
//! let out = mmdio::encode_model(&model)?;
//! std::fs::write("copy.pmx", out)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Only PMX is written. A document decoded from a PMD file is promoted to
//! PMX 2.0 on the way out, and index widths are always re-derived from the
//! element counts, so editing a document in memory never produces a file
//! with overflowing index fields.
//!
//! # Motions
//!
//! ```no_run
//! let bytes = std::fs::read("dance.vmd")?;
//! let motion = mmdio::decode_motion(&bytes)?;
//! println!("last frame: {}", motion.max_frame());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! A motion file is a flat record stream; the decoder groups it into
//! per-bone and per-morph tracks, sorted by frame, keeping the order the
//! track names first appear in the file. Retargeting a motion onto an
//! armature with different bone names goes through the [`BoneMapper`]
//! trait; see [`MotionDocument::retargeted`].
//!
//! # Limitations
//!
//! - PMD and VMD files always use Shift-JIS text; decoding replaces
//!   unmappable bytes rather than failing.
//! - The PMX 2.1 soft-body section is skipped on read and never written.
//! - Decoded documents are validated (index ranges, bone parent cycles,
//!   face/material consistency), so a successfully decoded document can
//!   always be re-encoded.

pub mod document;
pub mod error;
pub mod motion;
pub mod parsers;
pub mod runtime;
pub mod writers;

pub use document::{ModelDocument, ModelVersion};
pub use error::Error;
pub use motion::{BoneMapper, MotionDocument};
pub use parsers::model::decode_model;
pub use parsers::vmd::decode_motion;
pub use parsers::TextCodec;
pub use runtime::{
    dispatch, export_model, export_motion, import_model, import_motion, BoneNameCache,
    CommandInput, CommandOutput, ExportSettings, ImportSettings, MotionImportSettings,
    SectionSet,
};
pub use writers::model::encode_model;
pub use writers::vmd::encode_motion;

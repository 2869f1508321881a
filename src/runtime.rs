//! The boundary between the codecs and a host application.
//!
//! Everything that touches the filesystem or applies host policy lives
//! here: import/export entry points with their settings structs, section
//! filtering, bone renaming, material sorting, texture copying and the
//! string-keyed command table a host plugin can dispatch through. The
//! codecs below this module never do I/O and never scale.

use crate::document::{DisplayElement, ModelDocument, MorphOffsets};
use crate::error::Error;
use crate::motion::{BoneMapper, MotionDocument};
use crate::parsers::{model::decode_model, vmd::decode_motion};
use crate::writers::{model::encode_model, vmd::encode_motion};
use bitflags::bitflags;
use linked_hash_map::LinkedHashMap;
use log::{info, warn};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

bitflags! {
    /// Selectable parts of a model document.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionSet: u8 {
        const MESH = 1;
        const ARMATURE = 2;
        const PHYSICS = 4;
        const DISPLAY = 8;
        const MORPHS = 16;
    }
}

impl SectionSet {
    /// Expands a selection with the sections it depends on: physics,
    /// display frames and morphs all reference bones, and morphs also
    /// reference vertices.
    pub fn effective(self) -> SectionSet {
        let mut out = self;
        if out.intersects(SectionSet::PHYSICS | SectionSet::DISPLAY | SectionSet::MORPHS) {
            out |= SectionSet::ARMATURE;
        }
        if out.contains(SectionSet::MORPHS) {
            out |= SectionSet::MESH;
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct ImportSettings {
    pub sections: SectionSet,
    /// Uniform scale applied to the decoded document. Must be positive.
    pub scale: f32,
    /// Rename bones to the host's left/right suffix convention.
    pub rename_bones: bool,
    /// Forwarded to the host's material setup; the codec never reads them.
    pub use_mipmap: bool,
    pub sph_blend_factor: f32,
    pub spa_blend_factor: f32,
}

impl Default for ImportSettings {
    fn default() -> Self {
        ImportSettings {
            sections: SectionSet::all(),
            scale: 0.2,
            rename_bones: true,
            use_mipmap: true,
            sph_blend_factor: 1.0,
            spa_blend_factor: 1.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExportSettings {
    /// Copy referenced texture files next to the written model and rewrite
    /// the texture table to bare file names.
    pub copy_textures: bool,
    /// Reorder materials so fully opaque ones come first.
    pub sort_materials: bool,
    /// Directory texture paths are resolved against when copying. Relative
    /// paths resolve against the process working directory when unset.
    pub texture_source_dir: Option<PathBuf>,
}

#[derive(Clone, Copy)]
pub struct MotionImportSettings<'a> {
    /// Uniform scale applied to translations. Must be positive and should
    /// match the scale the target model was imported with.
    pub scale: f32,
    /// Number of blank frames inserted before the motion, leaving room for
    /// a bind pose at the start of the timeline.
    pub frame_margin: u32,
    /// Optional renaming of bone tracks to the target armature's names.
    /// Unmapped tracks are dropped with a warning; use
    /// [`MotionDocument::retargeted`] directly for strict resolution.
    pub mapper: Option<&'a dyn BoneMapper>,
}

impl Default for MotionImportSettings<'_> {
    fn default() -> Self {
        MotionImportSettings {
            scale: 0.2,
            frame_margin: 5,
            mapper: None,
        }
    }
}

fn check_scale(scale: f32) -> Result<(), Error> {
    if scale > 0.0 {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("scale factor {} is not positive", scale),
        )
        .into())
    }
}

/// Reads and decodes a model file, then applies the host policy from the
/// settings: section filtering, bone renaming and unit scaling.
pub fn import_model(path: &Path, settings: &ImportSettings) -> Result<ModelDocument, Error> {
    check_scale(settings.scale)?;
    let bytes = fs::read(path)?;
    let mut doc = decode_model(&bytes)?;
    info!(
        "imported model {:?} ({:?}): {} vertices, {} bones, {} morphs",
        doc.name,
        doc.header.version,
        doc.vertices.len(),
        doc.bones.len(),
        doc.morphs.len()
    );

    let sections = settings.sections.effective();
    if sections != SectionSet::all() {
        filter_sections(&mut doc, sections);
    }
    if settings.rename_bones {
        for bone in &mut doc.bones {
            bone.name = convert_name_lr(&bone.name);
        }
    }
    Ok(doc.scaled(settings.scale))
}

/// Encodes a model document to a file, optionally sorting materials and
/// copying its textures next to it.
pub fn export_model(
    doc: &ModelDocument,
    path: &Path,
    settings: &ExportSettings,
) -> Result<(), Error> {
    // The transforms below index the face stream by material face counts,
    // so the document must be consistent before any of them run.
    doc.validate()?;
    let mut doc = doc.clone();
    if settings.sort_materials {
        sort_materials(&mut doc);
    }
    if settings.copy_textures {
        copy_textures(&mut doc, path, settings.texture_source_dir.as_deref())?;
    }
    let bytes = encode_model(&doc)?;
    fs::write(path, &bytes)?;
    info!("exported model {:?}: {} bytes", doc.name, bytes.len());
    Ok(())
}

/// Reads and decodes a motion file, then scales, shifts and retargets it
/// per the settings.
pub fn import_motion(
    path: &Path,
    settings: &MotionImportSettings<'_>,
) -> Result<MotionDocument, Error> {
    check_scale(settings.scale)?;
    let bytes = fs::read(path)?;
    let mut doc = decode_motion(&bytes)?;
    info!(
        "imported motion for model {:?}: {} bone tracks, {} morph tracks, last frame {}",
        doc.model_name,
        doc.bone_tracks.len(),
        doc.morph_tracks.len(),
        doc.max_frame()
    );
    doc = doc.scaled(settings.scale).shifted(settings.frame_margin);
    if let Some(mapper) = settings.mapper {
        doc = doc.retargeted(mapper, false)?;
    }
    Ok(doc)
}

pub fn export_motion(doc: &MotionDocument, path: &Path) -> Result<(), Error> {
    let bytes = encode_motion(doc);
    fs::write(path, &bytes)?;
    info!("exported motion: {} bytes", bytes.len());
    Ok(())
}

/// Drops the sections outside the selection. The selection is assumed to be
/// already expanded (see [`SectionSet::effective`]); references into dropped
/// sections are cleared so the document stays valid.
fn filter_sections(doc: &mut ModelDocument, sections: SectionSet) {
    if !sections.contains(SectionSet::MESH) {
        doc.vertices.clear();
        doc.faces.clear();
        doc.textures.clear();
        doc.materials.clear();
    }
    if !sections.contains(SectionSet::ARMATURE) {
        doc.bones.clear();
        doc.strip_skinning_references();
        doc.display_frames.clear();
        doc.rigid_bodies.clear();
        doc.joints.clear();
    }
    if !sections.contains(SectionSet::PHYSICS) {
        doc.rigid_bodies.clear();
        doc.joints.clear();
    }
    if !sections.contains(SectionSet::DISPLAY) {
        doc.display_frames.clear();
    }
    if !sections.contains(SectionSet::MORPHS) {
        doc.morphs.clear();
        for frame in &mut doc.display_frames {
            frame
                .elements
                .retain(|e| !matches!(e, DisplayElement::Morph(_)));
        }
    }
}

/// Stable-partitions the material list so fully opaque materials come first,
/// which most renderers want for alpha blending. Each material owns a
/// consecutive run of the face stream, so the runs are reordered along with
/// the materials, and material morphs are remapped to the new indices.
fn sort_materials(doc: &mut ModelDocument) {
    let mut spans = Vec::with_capacity(doc.materials.len());
    let mut at = 0usize;
    for material in &doc.materials {
        let faces = material.face_vertex_count as usize / 3;
        spans.push(at..at + faces);
        at += faces;
    }

    let mut order: Vec<usize> = (0..doc.materials.len()).collect();
    order.sort_by_key(|&i| doc.materials[i].diffuse[3] < 1.0);

    let mut remap = vec![0u32; order.len()];
    for (new, &old) in order.iter().enumerate() {
        remap[old] = new as u32;
    }

    let mut materials = Vec::with_capacity(doc.materials.len());
    let mut faces = Vec::with_capacity(doc.faces.len());
    for &old in &order {
        materials.push(doc.materials[old].clone());
        faces.extend_from_slice(&doc.faces[spans[old].clone()]);
    }
    doc.materials = materials;
    doc.faces = faces;

    for morph in &mut doc.morphs {
        if let MorphOffsets::Material(offsets) = &mut morph.offsets {
            for offset in offsets {
                if let Some(old) = offset.material {
                    offset.material = Some(remap[old as usize]);
                }
            }
        }
    }
}

/// Copies every referenced texture into the exported model's directory and
/// rewrites the texture table to bare file names. A missing source file is
/// skipped with a warning, its table entry left untouched.
fn copy_textures(
    doc: &mut ModelDocument,
    model_path: &Path,
    source_dir: Option<&Path>,
) -> Result<(), Error> {
    let dest_dir = model_path.parent().unwrap_or_else(|| Path::new("."));
    for entry in &mut doc.textures {
        let source = match source_dir {
            Some(dir) => dir.join(entry.as_str()),
            None => PathBuf::from(entry.as_str()),
        };
        let Some(file_name) = source.file_name() else {
            warn!("texture entry {:?} has no file name, skipping", entry);
            continue;
        };
        let dest = dest_dir.join(file_name);
        if source == dest {
            continue;
        }
        match fs::copy(&source, &dest) {
            Ok(_) => *entry = file_name.to_string_lossy().into_owned(),
            Err(e) => warn!("could not copy texture {:?}: {}", source, e),
        }
    }
    Ok(())
}

/// Converts a name from the file convention, where laterality is a 左/右
/// prefix, to the host convention of a `.L`/`.R` suffix.
pub fn convert_name_lr(name: &str) -> String {
    if let Some(rest) = name.strip_prefix('左') {
        format!("{}.L", rest)
    } else if let Some(rest) = name.strip_prefix('右') {
        format!("{}.R", rest)
    } else {
        name.to_owned()
    }
}

/// Mapper that keeps every track under its original name.
pub struct IdentityMapper;

impl BoneMapper for IdentityMapper {
    fn resolve(&self, name: &str) -> Option<String> {
        Some(name.to_owned())
    }
}

/// Mapper backed by an explicit rename table. Names missing from the table
/// are unmapped.
pub struct RenameTableMapper {
    table: HashMap<String, String>,
}

impl RenameTableMapper {
    pub fn new(table: impl IntoIterator<Item = (String, String)>) -> Self {
        RenameTableMapper {
            table: table.into_iter().collect(),
        }
    }
}

impl BoneMapper for RenameTableMapper {
    fn resolve(&self, name: &str) -> Option<String> {
        self.table.get(name).cloned()
    }
}

/// Mapper applying the host's laterality convention ([`convert_name_lr`])
/// to every name. Always resolves.
pub struct HostConventionMapper;

impl BoneMapper for HostConventionMapper {
    fn resolve(&self, name: &str) -> Option<String> {
        Some(convert_name_lr(name))
    }
}

/// Japanese-to-English bone name dictionary built from decoded models.
///
/// The cache is an explicit value the host owns for as long as it wants the
/// names remembered, typically one per loaded scene. Hosts with a
/// plugin-reload lifecycle should call [`BoneNameCache::clear`] from their
/// unload hook; there is no global instance to forget about.
#[derive(Debug, Default)]
pub struct BoneNameCache {
    names: LinkedHashMap<String, String>,
}

impl BoneNameCache {
    pub fn new() -> Self {
        BoneNameCache::default()
    }

    /// Records every bone of the model that has both names filled in.
    pub fn absorb(&mut self, doc: &ModelDocument) {
        for bone in &doc.bones {
            if !bone.name.is_empty() && !bone.name_en.is_empty() {
                self.names.insert(bone.name.clone(), bone.name_en.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn clear(&mut self) {
        self.names.clear();
    }
}

impl BoneMapper for BoneNameCache {
    fn resolve(&self, name: &str) -> Option<String> {
        self.names.get(name).cloned()
    }
}

/// Owned input of one command dispatch.
#[derive(Debug)]
pub enum CommandInput {
    ImportModel {
        path: PathBuf,
        settings: ImportSettings,
    },
    ExportModel {
        model: ModelDocument,
        path: PathBuf,
        settings: ExportSettings,
    },
    ImportMotion {
        path: PathBuf,
        scale: f32,
        frame_margin: u32,
    },
    ExportMotion {
        motion: MotionDocument,
        path: PathBuf,
    },
}

#[derive(Debug)]
pub enum CommandOutput {
    Model(ModelDocument),
    Motion(MotionDocument),
    Written,
}

pub type CommandFn = fn(CommandInput) -> Result<CommandOutput, Error>;

/// The command table: one plain function per operation, dispatched by name.
/// Hosts that route operations through strings (menus, RPC) can bind to
/// this table instead of linking the entry points individually.
pub const COMMANDS: &[(&str, CommandFn)] = &[
    ("import_model", cmd_import_model),
    ("export_model", cmd_export_model),
    ("import_motion", cmd_import_motion),
    ("export_motion", cmd_export_motion),
];

pub fn dispatch(command: &str, input: CommandInput) -> Result<CommandOutput, Error> {
    match COMMANDS.iter().find(|(name, _)| *name == command) {
        Some((_, f)) => f(input),
        None => Err(Error::UnknownCommand(command.to_owned())),
    }
}

fn cmd_import_model(input: CommandInput) -> Result<CommandOutput, Error> {
    match input {
        CommandInput::ImportModel { path, settings } => {
            import_model(&path, &settings).map(CommandOutput::Model)
        }
        _ => Err(Error::InvalidCommandInput {
            command: "import_model",
        }),
    }
}

fn cmd_export_model(input: CommandInput) -> Result<CommandOutput, Error> {
    match input {
        CommandInput::ExportModel {
            model,
            path,
            settings,
        } => export_model(&model, &path, &settings).map(|_| CommandOutput::Written),
        _ => Err(Error::InvalidCommandInput {
            command: "export_model",
        }),
    }
}

fn cmd_import_motion(input: CommandInput) -> Result<CommandOutput, Error> {
    match input {
        CommandInput::ImportMotion {
            path,
            scale,
            frame_margin,
        } => {
            let settings = MotionImportSettings {
                scale,
                frame_margin,
                mapper: None,
            };
            import_motion(&path, &settings).map(CommandOutput::Motion)
        }
        _ => Err(Error::InvalidCommandInput {
            command: "import_motion",
        }),
    }
}

fn cmd_export_motion(input: CommandInput) -> Result<CommandOutput, Error> {
    match input {
        CommandInput::ExportMotion { motion, path } => {
            export_motion(&motion, &path).map(|_| CommandOutput::Written)
        }
        _ => Err(Error::InvalidCommandInput {
            command: "export_motion",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Material, ModelVersion, Morph, MorphPanel, MorphOffsets, MaterialMorphOffset, MaterialMorphOp};
    use crate::parsers::TextCodec;

    fn material(name: &str, alpha: f32, faces: u32) -> Material {
        Material {
            name: name.into(),
            name_en: String::new(),
            diffuse: [1.0, 1.0, 1.0, alpha],
            specular: [0.0; 3],
            shininess: 5.0,
            ambient: [0.5; 3],
            double_sided: false,
            ground_shadow: true,
            cast_self_shadow: true,
            receive_self_shadow: true,
            edge: true,
            edge_color: [0.0, 0.0, 0.0, 1.0],
            edge_size: 1.0,
            texture: None,
            sphere_texture: None,
            sphere_mode: crate::document::SphereMode::None,
            toon: crate::document::Toon::Texture(None),
            memo: String::new(),
            face_vertex_count: faces * 3,
        }
    }

    #[test]
    fn selecting_morphs_pulls_in_mesh_and_armature() {
        let effective = SectionSet::MORPHS.effective();
        assert_eq!(
            effective,
            SectionSet::MORPHS | SectionSet::MESH | SectionSet::ARMATURE
        );
    }

    #[test]
    fn selecting_physics_pulls_in_armature_only() {
        let effective = SectionSet::PHYSICS.effective();
        assert_eq!(effective, SectionSet::PHYSICS | SectionSet::ARMATURE);
    }

    #[test]
    fn laterality_prefix_becomes_suffix() {
        assert_eq!(convert_name_lr("左腕"), "腕.L");
        assert_eq!(convert_name_lr("右ひざ"), "ひざ.R");
        assert_eq!(convert_name_lr("センター"), "センター");
    }

    #[test]
    fn sort_materials_moves_opaque_first_and_keeps_face_spans() {
        let mut doc = ModelDocument::new(ModelVersion::Pmx20, TextCodec::Utf8);
        doc.vertices = vec![crate::document::Vertex {
            position: [0.0; 3],
            normal: [0.0, 1.0, 0.0],
            uv: [0.0; 2],
            extra_uvs: Vec::new(),
            skinning: crate::document::Skinning::Bdef1 { bone: None },
            edge_scale: 1.0,
        }];
        doc.faces = vec![[0, 0, 0], [0, 0, 0], [0, 0, 0]];
        doc.materials = vec![
            material("glass", 0.5, 1),
            material("skin", 1.0, 2),
        ];
        doc.morphs.push(Morph {
            name: "tint".into(),
            name_en: String::new(),
            panel: MorphPanel::Other,
            offsets: MorphOffsets::Material(vec![MaterialMorphOffset {
                material: Some(0),
                operation: MaterialMorphOp::Multiply,
                diffuse: [1.0; 4],
                specular: [1.0; 3],
                shininess: 1.0,
                ambient: [1.0; 3],
                edge_color: [1.0; 4],
                edge_size: 1.0,
                texture: [1.0; 4],
                sphere: [1.0; 4],
                toon: [1.0; 4],
            }]),
        });

        sort_materials(&mut doc);
        assert_eq!(doc.materials[0].name, "skin");
        assert_eq!(doc.materials[1].name, "glass");
        assert_eq!(doc.faces.len(), 3);
        // The morph still points at the glass material.
        let MorphOffsets::Material(offsets) = &doc.morphs[0].offsets else {
            panic!("material morph expected");
        };
        assert_eq!(offsets[0].material, Some(1));
        doc.validate().unwrap();
    }

    #[test]
    fn cache_resolves_after_absorbing_a_model() {
        let mut doc = ModelDocument::new(ModelVersion::Pmx20, TextCodec::Utf8);
        doc.bones.push(crate::document::Bone {
            name: "センター".into(),
            name_en: "center".into(),
            position: [0.0; 3],
            parent: None,
            deform_layer: 0,
            tail: crate::document::BoneTail::Offset([0.0; 3]),
            rotatable: true,
            translatable: true,
            visible: true,
            operable: true,
            inherit: None,
            fixed_axis: None,
            local_axes: None,
            after_physics: false,
            external_parent: None,
            ik: None,
        });
        let mut cache = BoneNameCache::new();
        cache.absorb(&doc);
        assert_eq!(cache.resolve("センター").as_deref(), Some("center"));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.resolve("センター"), None);
    }

    #[test]
    fn unknown_command_is_rejected() {
        let err = dispatch(
            "transmogrify",
            CommandInput::ExportMotion {
                motion: MotionDocument::new(""),
                path: PathBuf::from("out.vmd"),
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnknownCommand(name) if name == "transmogrify"));
    }

    #[test]
    fn mismatched_command_input_is_rejected() {
        let err = dispatch(
            "import_model",
            CommandInput::ExportMotion {
                motion: MotionDocument::new(""),
                path: PathBuf::from("out.vmd"),
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidCommandInput {
                command: "import_model"
            }
        ));
    }

    #[test]
    fn export_refuses_inconsistent_face_counts() {
        // One material claims 9 face vertices but the face stream is empty;
        // sorting must not get as far as slicing the stream.
        let mut doc = ModelDocument::new(ModelVersion::Pmx20, TextCodec::Utf8);
        doc.materials = vec![material("m", 1.0, 3)];
        let settings = ExportSettings {
            sort_materials: true,
            ..ExportSettings::default()
        };
        let err = export_model(&doc, Path::new("out.pmx"), &settings).unwrap_err();
        assert!(matches!(err, Error::MalformedSection { section: "material", .. }));
    }

    #[test]
    fn zero_scale_is_refused() {
        let settings = ImportSettings {
            scale: 0.0,
            ..ImportSettings::default()
        };
        let err = import_model(Path::new("does-not-exist.pmx"), &settings).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}

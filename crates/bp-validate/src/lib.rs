// SPDX-License-Identifier: MIT OR Apache-2.0
//! bp-validate
#![deny(unsafe_code)]
//!
//! Canonicalizes duck-typed action objects into [`bp_core::Action`] values
//! and enforces the shape/path/policy/size rules shared by every entry path
//! (direct `/enqueue` calls and the codex job bridge alike). Type resolution
//! is table-driven `const` data; the per-type default-field derivations that
//! follow it are expressed as the same type-dispatch-then-setdefault shape
//! the normalizer they are grounded on uses, since which source field a
//! default is pulled from varies by destination field, not just by a fixed
//! rename map.

use bp_core::{Action, ActionType, EditScriptMode};
use bp_policy::PolicyEngine;
use serde_json::{Map, Value};

/// Synonym `type` strings accepted for each canonical action type.
///
/// Lookup is on the lower-cased, whitespace-stripped input, so
/// `"CreateFolder"`, `"createfolder"`, and `" createFolder "` all match.
const TYPE_ALIASES: &[(&str, ActionType)] = &[
    // canonical spellings, pass through unchanged
    ("createinstance", ActionType::CreateInstance),
    ("insertasset", ActionType::InsertAsset),
    ("setproperty", ActionType::SetProperty),
    ("setproperties", ActionType::SetProperties),
    ("cloneinstance", ActionType::CloneInstance),
    ("clearchildren", ActionType::ClearChildren),
    ("settags", ActionType::SetTags),
    ("deleteinstance", ActionType::DeleteInstance),
    ("rename", ActionType::Rename),
    ("move", ActionType::Move),
    ("setattribute", ActionType::SetAttribute),
    ("setattributes", ActionType::SetAttributes),
    ("editscript", ActionType::EditScript),
    ("tween", ActionType::Tween),
    ("emitparticles", ActionType::EmitParticles),
    ("playsound", ActionType::PlaySound),
    ("animationcreate", ActionType::AnimationCreate),
    ("animationaddkeyframe", ActionType::AnimationAddKeyframe),
    ("animationpreview", ActionType::AnimationPreview),
    ("animationstop", ActionType::AnimationStop),
    // synonyms
    ("createfolder", ActionType::CreateInstance),
    ("create_folder", ActionType::CreateInstance),
    ("createscript", ActionType::CreateInstance),
    ("create_script", ActionType::CreateInstance),
    ("createlocalscript", ActionType::CreateInstance),
    ("create_localscript", ActionType::CreateInstance),
    ("createmodulescript", ActionType::CreateInstance),
    ("create_modulescript", ActionType::CreateInstance),
    ("setscript", ActionType::EditScript),
    ("setsource", ActionType::EditScript),
    ("setscriptsource", ActionType::EditScript),
    ("edit", ActionType::EditScript),
    ("setparent", ActionType::Move),
    ("moveinstance", ActionType::Move),
    ("renameinstance", ActionType::Rename),
    ("setname", ActionType::Rename),
    ("delete", ActionType::DeleteInstance),
    ("remove", ActionType::DeleteInstance),
    ("destroy", ActionType::DeleteInstance),
    ("destroyinstance", ActionType::DeleteInstance),
    ("clone", ActionType::CloneInstance),
    ("removechildren", ActionType::ClearChildren),
    ("addtags", ActionType::SetTags),
    ("removetags", ActionType::SetTags),
    ("loadasset", ActionType::InsertAsset),
    ("insert", ActionType::InsertAsset),
    ("tweeninstance", ActionType::Tween),
    ("emit", ActionType::EmitParticles),
    ("playaudio", ActionType::PlaySound),
    ("createanimation", ActionType::AnimationCreate),
    ("addkeyframe", ActionType::AnimationAddKeyframe),
    ("previewanimation", ActionType::AnimationPreview),
    ("stopanimation", ActionType::AnimationStop),
];

/// Look up the canonical action type for a synonym `type` string.
pub fn canonical_action_type(raw: &str) -> Option<ActionType> {
    let key = raw.trim().to_ascii_lowercase();
    TYPE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, canonical)| *canonical)
}

/// `true` for any JSON value a caller would consider "present and meaningful"
/// (mirrors Python truthiness: `null`, `false`, `0`, and `""` are all absent).
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// The first truthy value found under any of `keys`, checked in order.
fn first_present(map: &Map<String, Value>, keys: &[&str]) -> Option<Value> {
    keys.iter()
        .find_map(|key| map.get(*key).filter(|v| is_truthy(v)))
        .cloned()
}

/// Insert `value` under `key` only if `key` is not already present, matching
/// `dict.setdefault`'s "absent, not falsy" semantics.
fn set_default(map: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if !map.contains_key(key) {
        if let Some(v) = value {
            map.insert(key.to_string(), v);
        }
    }
}

/// Side effects tied to the specific alias that resolved the type, not to
/// the resolved type itself — e.g. `createFolder`'s `className` literal
/// default differs from `createScript`'s even though both resolve to
/// `createInstance`.
fn apply_alias_defaults(lower: &str, map: &mut Map<String, Value>) {
    match lower {
        "createfolder" | "create_folder" => {
            let class = first_present(map, &["class"]).unwrap_or_else(|| Value::String("Folder".into()));
            set_default(map, "className", Some(class));
        }
        "createscript" | "create_script" => {
            let class = first_present(map, &["class"]).unwrap_or_else(|| Value::String("Script".into()));
            set_default(map, "className", Some(class));
        }
        "createlocalscript" | "create_localscript" => {
            let class =
                first_present(map, &["class"]).unwrap_or_else(|| Value::String("LocalScript".into()));
            set_default(map, "className", Some(class));
        }
        "createmodulescript" | "create_modulescript" => {
            let class =
                first_present(map, &["class"]).unwrap_or_else(|| Value::String("ModuleScript".into()));
            set_default(map, "className", Some(class));
        }
        "setscript" | "setsource" | "setscriptsource" => {
            map.entry("mode".to_string())
                .or_insert_with(|| Value::String("replace".to_string()));
            if !map.contains_key("source") {
                if let Some(v) = first_present(map, &["scriptSource", "content", "text", "value"]) {
                    map.insert("source".to_string(), v);
                }
            }
        }
        "addtags" => {
            map.entry("mode".to_string())
                .or_insert_with(|| Value::String("add".to_string()));
        }
        "removetags" => {
            map.entry("mode".to_string())
                .or_insert_with(|| Value::String("remove".to_string()));
        }
        _ => {}
    }
}

/// Default-field derivation keyed by the *resolved* canonical type, applied
/// regardless of which alias (or none) produced it.
fn apply_resolved_defaults(action_type: ActionType, map: &mut Map<String, Value>) {
    use ActionType::*;

    if matches!(
        action_type,
        SetProperty
            | SetProperties
            | DeleteInstance
            | Rename
            | Move
            | SetAttribute
            | SetAttributes
            | EditScript
            | CloneInstance
            | ClearChildren
            | SetTags
            | Tween
            | EmitParticles
    ) {
        set_default(map, "path", first_present(map, &["targetPath", "target"]));
    }

    match action_type {
        CreateInstance => {
            set_default(map, "parentPath", first_present(map, &["parent", "parent_path"]));
            set_default(map, "className", first_present(map, &["class", "class_name"]));
            if !map.contains_key("source") {
                if let Some(v) = first_present(map, &["content", "text", "value"]) {
                    map.insert("source".to_string(), v);
                }
            }
        }
        InsertAsset => {
            set_default(map, "parentPath", first_present(map, &["parent", "parent_path"]));
            set_default(map, "assetId", first_present(map, &["id", "asset", "assetID"]));
        }
        SetProperty => {
            set_default(map, "property", first_present(map, &["key"]));
        }
        SetProperties => {
            set_default(map, "properties", first_present(map, &["props", "values"]));
        }
        SetAttribute => {
            set_default(map, "attribute", first_present(map, &["key"]));
        }
        SetAttributes => {
            set_default(map, "attributes", first_present(map, &["attrs", "values"]));
        }
        Move => {
            set_default(map, "newParentPath", first_present(map, &["parentPath", "parent"]));
        }
        Rename => {
            set_default(map, "newName", first_present(map, &["name"]));
        }
        CloneInstance => {
            set_default(map, "sourcePath", first_present(map, &["source", "path"]));
            if !map.contains_key("path") {
                if let Some(v) = map.get("sourcePath").cloned() {
                    map.insert("path".to_string(), v);
                }
            }
            set_default(map, "parentPath", first_present(map, &["parent", "parentPath"]));
        }
        EditScript => {
            map.entry("mode".to_string())
                .or_insert_with(|| Value::String("replace".to_string()));
            if !map.contains_key("source") && !map.contains_key("chunks") {
                if let Some(v) = first_present(map, &["content", "text", "value"]) {
                    map.insert("source".to_string(), v);
                }
            }
        }
        PlaySound => {
            set_default(map, "path", first_present(map, &["targetPath", "target"]));
            set_default(map, "soundId", first_present(map, &["id", "sound", "assetId"]));
        }
        AnimationCreate => {
            set_default(map, "parentPath", first_present(map, &["parent", "parent_path"]));
            set_default(map, "name", first_present(map, &["animationName", "sequenceName"]));
        }
        AnimationAddKeyframe => {
            set_default(map, "path", first_present(map, &["sequencePath", "targetPath", "target"]));
        }
        AnimationPreview => {
            set_default(map, "rigPath", first_present(map, &["rig", "targetPath"]));
            set_default(map, "sequencePath", first_present(map, &["path", "sequence"]));
        }
        _ => {}
    }
}

fn action_type_wire_name(action_type: ActionType) -> &'static str {
    match action_type {
        ActionType::CreateInstance => "createInstance",
        ActionType::InsertAsset => "insertAsset",
        ActionType::SetProperty => "setProperty",
        ActionType::SetProperties => "setProperties",
        ActionType::CloneInstance => "cloneInstance",
        ActionType::ClearChildren => "clearChildren",
        ActionType::SetTags => "setTags",
        ActionType::DeleteInstance => "deleteInstance",
        ActionType::Rename => "rename",
        ActionType::Move => "move",
        ActionType::SetAttribute => "setAttribute",
        ActionType::SetAttributes => "setAttributes",
        ActionType::EditScript => "editScript",
        ActionType::Tween => "tween",
        ActionType::EmitParticles => "emitParticles",
        ActionType::PlaySound => "playSound",
        ActionType::AnimationCreate => "animationCreate",
        ActionType::AnimationAddKeyframe => "animationAddKeyframe",
        ActionType::AnimationPreview => "animationPreview",
        ActionType::AnimationStop => "animationStop",
    }
}

/// Canonicalize one raw JSON action object into an [`Action`]: resolve its
/// type against every accepted synonym, apply the alias's own side effects,
/// then the universal per-type default-field derivations. Pure: no side
/// effects beyond the returned value, no policy checks.
pub fn normalize_action(raw: &Value) -> Result<Action, String> {
    let obj = raw.as_object().ok_or_else(|| "not an object".to_string())?;
    let mut map = obj.clone();

    let raw_type = map
        .get("type")
        .or_else(|| map.get("action"))
        .or_else(|| map.get("actionType"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    if raw_type.is_empty() {
        return Err("missing action type".to_string());
    }
    let lower = raw_type.to_ascii_lowercase();

    apply_alias_defaults(&lower, &mut map);

    let canonical =
        canonical_action_type(&lower).ok_or_else(|| format!("unrecognized action type '{raw_type}'"))?;

    apply_resolved_defaults(canonical, &mut map);

    map.remove("type");
    map.insert(
        "actionType".to_string(),
        Value::String(action_type_wire_name(canonical).to_string()),
    );

    serde_json::from_value(Value::Object(map)).map_err(|e| format!("malformed action: {e}"))
}

/// Source of cached fingerprints used for `expectedHash` preconditions.
///
/// `bp-context` implements this over its live snapshot cache; tests and
/// standalone callers can use [`NoCachedContext`] to simulate "no context
/// exported yet".
pub trait FingerprintLookup {
    /// Return the currently cached fingerprint for `path`, if any.
    fn fingerprint_for(&self, path: &str) -> Option<String>;
}

/// A [`FingerprintLookup`] that never has a cached fingerprint.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCachedContext;

impl FingerprintLookup for NoCachedContext {
    fn fingerprint_for(&self, _path: &str) -> Option<String> {
        None
    }
}

/// Fixed rules applied to every normalized action, independent of per-action content.
#[derive(Debug, Clone, Copy)]
pub struct ValidatorConfig<'a> {
    /// Active policy engine (profile gates + path ACLs).
    pub policy: &'a PolicyEngine,
    /// Per-transaction action count cap.
    pub max_actions: usize,
    /// Prefix every path-bearing action's path must begin with (e.g. `"game/"`).
    pub host_root_prefix: &'a str,
}

/// Validate and normalize a raw action list, accumulating every problem
/// found rather than stopping at the first. Returns the normalized actions
/// on success, or one `"action {idx}: {problem}"` message per failure.
pub fn validate_actions(
    raw_actions: &[Value],
    config: &ValidatorConfig<'_>,
    fingerprints: &dyn FingerprintLookup,
) -> Result<Vec<Action>, Vec<String>> {
    if raw_actions.len() > config.max_actions {
        return Err(vec![format!(
            "too many actions: {} exceeds the cap of {}",
            raw_actions.len(),
            config.max_actions
        )]);
    }

    let mut errors = Vec::new();
    let mut normalized = Vec::with_capacity(raw_actions.len());

    for (idx, raw) in raw_actions.iter().enumerate() {
        match normalize_action(raw) {
            Err(reason) => errors.push(format!("action {idx}: {reason}")),
            Ok(action) => {
                let action_errors = validate_one(&action, config, fingerprints);
                if action_errors.is_empty() {
                    normalized.push(action);
                } else {
                    errors.extend(
                        action_errors
                            .into_iter()
                            .map(|reason| format!("action {idx}: {reason}")),
                    );
                }
            }
        }
    }

    if errors.is_empty() {
        Ok(normalized)
    } else {
        Err(errors)
    }
}

fn validate_one(
    action: &Action,
    config: &ValidatorConfig<'_>,
    fingerprints: &dyn FingerprintLookup,
) -> Vec<String> {
    let mut errors = Vec::new();
    let Some(action_type) = action.action_type else {
        errors.push("missing action type".to_string());
        return errors;
    };

    let gate = config.policy.check_action_type(action_type);
    if !gate.allowed {
        errors.push(gate.reason.unwrap_or_else(|| "blocked by policy".to_string()));
    }

    let checked_path = match action_type {
        ActionType::CreateInstance => action.parent_path.as_deref(),
        _ => action.path.as_deref(),
    };
    if let Some(path) = checked_path {
        if !path.starts_with(config.host_root_prefix) {
            errors.push(format!(
                "path {path} does not start with required prefix {}",
                config.host_root_prefix
            ));
        }
        let decision = config.policy.check_path(std::path::Path::new(path));
        if !decision.allowed {
            errors.push(decision.reason.unwrap_or_else(|| "protected path".to_string()));
        }
    }

    match action_type {
        ActionType::CreateInstance => {
            if action.parent_path.is_none() {
                errors.push("createInstance requires parentPath".to_string());
            }
            if action.class_name.is_none() {
                errors.push("createInstance requires className".to_string());
            }
        }
        ActionType::EditScript => {
            if action.mode.is_none() {
                errors.push(format!(
                    "editScript requires mode ∈ {:?}",
                    [
                        EditScriptMode::Replace,
                        EditScriptMode::Append,
                        EditScriptMode::Prepend,
                        EditScriptMode::ReplaceRange,
                        EditScriptMode::InsertBefore,
                        EditScriptMode::InsertAfter,
                    ]
                ));
            }
            let source_bytes = action.source.as_ref().map(String::len).unwrap_or(0);
            let chunk_bytes: usize = action.chunks.iter().map(String::len).sum();
            let total = source_bytes + chunk_bytes;
            if total == 0 {
                errors.push("editScript requires source or chunks".to_string());
            }
            let cap = config.policy.effective_edit_byte_cap();
            if total as u64 > cap {
                errors.push(format!(
                    "editScript source of {total} bytes exceeds the cap of {cap} bytes"
                ));
            }
        }
        ActionType::AnimationPreview => {
            if action.sequence_path.is_none() && action.sequence.is_none() {
                errors.push("animationPreview requires sequencePath or sequence".to_string());
            }
        }
        ActionType::AnimationStop => {
            if action.rig_path.is_none() {
                errors.push("animationStop requires rigPath".to_string());
            }
        }
        _ => {}
    }

    let expected = action.expected_hash.clone().or_else(|| {
        action
            .extra
            .get("expectedSha1")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    });
    if let Some(expected) = &expected {
        let path = checked_path.unwrap_or_default();
        match fingerprints.fingerprint_for(path) {
            None => errors.push("expectedHash provided but no cached hash".to_string()),
            Some(actual) if &actual != expected => {
                errors.push("expectedHash mismatch".to_string())
            }
            Some(_) => {}
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use bp_policy::PolicyProfile;
    use serde_json::json;

    fn engine(profile: PolicyProfile) -> PolicyEngine {
        PolicyEngine::new(profile, &[], &["game/**".to_string()], 1_000, 10_000).unwrap()
    }

    fn config<'a>(policy: &'a PolicyEngine) -> ValidatorConfig<'a> {
        ValidatorConfig {
            policy,
            max_actions: 400,
            host_root_prefix: "game/",
        }
    }

    #[test]
    fn canonicalizes_known_type_aliases() {
        assert_eq!(
            canonical_action_type("CreateFolder"),
            Some(ActionType::CreateInstance)
        );
        assert_eq!(
            canonical_action_type("destroyinstance"),
            Some(ActionType::DeleteInstance)
        );
        assert_eq!(canonical_action_type("moveinstance"), Some(ActionType::Move));
        assert_eq!(canonical_action_type("bogus"), None);
    }

    #[test]
    fn create_script_defaults_class_name_to_script() {
        let raw = json!({ "type": "createScript", "parentPath": "game/Workspace" });
        let action = normalize_action(&raw).unwrap();
        assert_eq!(action.action_type, Some(ActionType::CreateInstance));
        assert_eq!(action.class_name.as_deref(), Some("Script"));
    }

    #[test]
    fn clone_instance_defaults_path_from_source_path() {
        let raw = json!({ "type": "cloneInstance", "source": "game/Workspace/Template" });
        let action = normalize_action(&raw).unwrap();
        assert_eq!(action.path.as_deref(), Some("game/Workspace/Template"));
    }

    #[test]
    fn normalizes_field_aliases_before_deserializing() {
        let raw = json!({
            "type": "setSource",
            "target": "game/Workspace/S",
            "content": "print(1)",
            "mode": "replace",
        });
        let action = normalize_action(&raw).unwrap();
        assert_eq!(action.action_type, Some(ActionType::EditScript));
        assert_eq!(action.path.as_deref(), Some("game/Workspace/S"));
        assert_eq!(action.source.as_deref(), Some("print(1)"));
    }

    #[test]
    fn rejects_unrecognized_type() {
        let raw = json!({ "type": "doSomethingWeird", "path": "game/X" });
        assert!(normalize_action(&raw).unwrap_err().contains("unrecognized"));
    }

    #[test]
    fn create_instance_requires_parent_and_class() {
        let policy = engine(PolicyProfile::Standard);
        let cfg = config(&policy);
        let raw = vec![json!({ "type": "createInstance", "parentPath": "game/Workspace" })];
        let errors = validate_actions(&raw, &cfg, &NoCachedContext).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("className")));
    }

    #[test]
    fn expected_hash_mismatch_is_reported_with_index() {
        struct Fixed;
        impl FingerprintLookup for Fixed {
            fn fingerprint_for(&self, _path: &str) -> Option<String> {
                Some("H1".to_string())
            }
        }
        let policy = engine(PolicyProfile::Standard);
        let cfg = config(&policy);
        let raw = vec![json!({
            "type": "editScript",
            "path": "game/S",
            "mode": "replace",
            "source": "x",
            "expectedHash": "H2",
        })];
        let errors = validate_actions(&raw, &cfg, &Fixed).unwrap_err();
        assert_eq!(errors, vec!["action 0: expectedHash mismatch".to_string()]);
    }

    #[test]
    fn safe_profile_blocks_structural_and_caps_edit_size() {
        let policy = engine(PolicyProfile::Safe);
        let cfg = config(&policy);
        let raw = vec![
            json!({ "type": "createInstance", "parentPath": "game/Workspace", "className": "Folder" }),
            json!({ "type": "editScript", "path": "game/S", "mode": "replace", "source": "x".repeat(2000) }),
        ];
        let errors = validate_actions(&raw, &cfg, &NoCachedContext).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("action 0")));
        assert!(errors.iter().any(|e| e.contains("action 1") && e.contains("exceeds")));
    }

    #[test]
    fn too_many_actions_fails_fast_with_single_reason() {
        let policy = engine(PolicyProfile::Power);
        let cfg = ValidatorConfig {
            policy: &policy,
            max_actions: 1,
            host_root_prefix: "game/",
        };
        let raw = vec![
            json!({ "type": "rename", "path": "game/A", "name": "B" }),
            json!({ "type": "rename", "path": "game/C", "name": "D" }),
        ];
        let errors = validate_actions(&raw, &cfg, &NoCachedContext).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("too many actions"));
    }

    #[test]
    fn path_outside_host_root_prefix_is_rejected() {
        let policy = engine(PolicyProfile::Power);
        let cfg = config(&policy);
        let raw = vec![json!({ "type": "rename", "path": "other/A", "name": "B" })];
        let errors = validate_actions(&raw, &cfg, &NoCachedContext).unwrap_err();
        assert!(errors[0].contains("does not start with required prefix"));
    }
}

//! Prompts for the multi-stage orchestrator and the hybrid fusion engine.
//!
//! Every prompt lives here so a wording change touches exactly one place and
//! unit tests can inspect prompts without a live model.

use crate::output::{Manifest, StageKind, StageOutput};

/// System message shared by every analysis call.
pub const SYSTEM_PROMPT: &str = r#"You are a senior CAD and engineering-drawing reviewer.
You are given a technical drawing (as an image, as extracted facts, or both).

Rules:
- Be specific and concise. Prefer short bullet lists.
- Only state what the evidence supports. Say "not visible" instead of guessing.
- Quote dimensions, tolerances and standards exactly as written on the drawing.
- Do NOT wrap the answer in code fences and do NOT add closing remarks."#;

/// Longest slice of a prior stage quoted into the next prompt.
const PRIOR_STAGE_CHARS: usize = 1200;

/// Longest slice of extracted drawing text quoted into a prompt.
const DRAWING_TEXT_CHARS: usize = 4000;

fn stage_task(stage: StageKind) -> &'static str {
    match stage {
        StageKind::Overview => {
            "STAGE 1: OVERVIEW\nDescribe: 1) the drawing type (part, assembly, floor plan, schematic …) 2) its likely purpose 3) overall complexity 4) the key visible features."
        }
        StageKind::ComponentIdentification => {
            "STAGE 2: COMPONENT IDENTIFICATION\nList: 1) the major parts or regions 2) how they relate or connect 3) materials or finishes called out 4) notable features (holes, threads, fillets, openings)."
        }
        StageKind::MeasurementExtraction => {
            "STAGE 3: MEASUREMENT EXTRACTION\nExtract: 1) critical dimensions with units 2) tolerances 3) angles and radii 4) constraints or fits. Use a `name: value unit` list."
        }
        StageKind::CrossReferencing => {
            "STAGE 4: CROSS-REFERENCING\nCompare the earlier findings with the parsed drawing facts below. Report: 1) values that agree 2) contradictions or values missing from either side 3) annotations, standards or title-block data not yet mentioned 4) drawing-quality issues."
        }
        StageKind::Synthesis => {
            "STAGE 5: SYNTHESIS\nWrite a 3–5 sentence executive summary of the drawing from the stage findings below. Mention anything left unresolved."
        }
        StageKind::Fusion => {
            "Using only the extracted evidence above, provide:\n1. What type of CAD drawing this most likely is.\n2. Its likely purpose and application.\n3. Key components and their relationships, as far as the evidence allows.\n4. Important dimensions and annotations.\n5. Data-quality concerns (disagreements between the parsed drawing and the image analysis)."
        }
    }
}

/// Compact description of a manifest for prompts.
pub fn manifest_brief(manifest: &Manifest) -> String {
    let s = &manifest.statistics;
    let mut out = format!(
        "DRAWING FACTS (parsed)\nFile: {}\nUnits: {}  Scale: {}  DXF version: {}\nExtents: ({:.3}, {:.3}) – ({:.3}, {:.3})\nEntities: {} total (TEXT {}, MTEXT {}, DIMENSION {}, LINE {}, CIRCLE {}, ARC {}, ELLIPSE {}, OTHER {})\nLayers: {}",
        manifest.source_file,
        manifest.units,
        manifest.scale,
        manifest.dxf_version,
        manifest.extents.min[0],
        manifest.extents.min[1],
        manifest.extents.max[0],
        manifest.extents.max[1],
        s.total_entities,
        s.text_entities,
        s.mtext_entities,
        s.dimension_entities,
        s.line_entities,
        s.circle_entities,
        s.arc_entities,
        s.ellipse_entities,
        s.other_entities,
        if manifest.layers.is_empty() {
            "(none)".to_string()
        } else {
            manifest.layers.join(", ")
        },
    );
    if manifest.is_failed() {
        out.push_str(&format!(
            "\nNote: the drawing could not be parsed ({}); rely on the image.",
            manifest.error_message.as_deref().unwrap_or("unknown reason")
        ));
    }
    out
}

/// Build the user prompt for one orchestrator stage.
///
/// `prior` holds the completed stages in order; `drawing_text` is the
/// text-extraction view of the manifest.
pub fn stage_prompt(
    stage: StageKind,
    manifest: &Manifest,
    drawing_text: &str,
    prior: &[StageOutput],
) -> String {
    let mut out = String::new();
    out.push_str(stage_task(stage));
    out.push_str("\n\n");
    out.push_str(&manifest_brief(manifest));

    if matches!(stage, StageKind::MeasurementExtraction | StageKind::CrossReferencing)
        && !drawing_text.trim().is_empty()
    {
        out.push_str("\n\nDRAWING TEXT (parsed)\n");
        out.push_str(&truncate_chars(drawing_text.trim(), DRAWING_TEXT_CHARS));
    }

    if !prior.is_empty() {
        out.push_str("\n\nEARLIER FINDINGS");
        for p in prior {
            out.push_str(&format!(
                "\n\n[{}]\n{}",
                p.stage.title(),
                truncate_chars(p.text.trim(), PRIOR_STAGE_CHARS)
            ));
        }
    } else if stage == StageKind::Synthesis {
        out.push_str("\n\nEARLIER FINDINGS\n(no stage completed; summarise the parsed facts only)");
    }
    out
}

/// Build the single hybrid-fusion prompt from serialised evidence.
pub fn fusion_prompt(evidence: &str) -> String {
    format!("{evidence}\n\n{}", stage_task(StageKind::Fusion))
}

/// Cut `s` to at most `max` characters on a char boundary, marking the cut.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{} …", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Provider;

    fn stage(kind: StageKind, text: &str) -> StageOutput {
        StageOutput {
            stage: kind,
            model_used: "m".into(),
            provider: Provider::OpenRouter,
            text: text.into(),
            attempts: 1,
            duration_ms: 1,
        }
    }

    #[test]
    fn system_prompt_forbids_fences() {
        assert!(SYSTEM_PROMPT.contains("code fences"));
    }

    #[test]
    fn stage_prompt_carries_prior_output() {
        let m = Manifest::failed("f", "Model", "a.dxf", "bad");
        let prior = vec![stage(StageKind::Overview, "A bracket.")];
        let p = stage_prompt(StageKind::ComponentIdentification, &m, "", &prior);
        assert!(p.starts_with("STAGE 2"));
        assert!(p.contains("[Overview]\nA bracket."));
        assert!(p.contains("could not be parsed"));
    }

    #[test]
    fn measurement_stage_includes_drawing_text() {
        let m = Manifest::failed("f", "Model", "a.dxf", "bad");
        let p = stage_prompt(StageKind::MeasurementExtraction, &m, "Ø20 H7", &[]);
        assert!(p.contains("Ø20 H7"));
        let p = stage_prompt(StageKind::Overview, &m, "Ø20 H7", &[]);
        assert!(!p.contains("Ø20 H7"));
    }

    #[test]
    fn synthesis_without_prior_says_so() {
        let m = Manifest::failed("f", "Model", "a.dxf", "bad");
        let p = stage_prompt(StageKind::Synthesis, &m, "", &[]);
        assert!(p.contains("no stage completed"));
    }

    #[test]
    fn truncate_is_char_safe() {
        assert_eq!(truncate_chars("ØØØØ", 2), "ØØ …");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn fusion_prompt_appends_task() {
        let p = fusion_prompt("EVIDENCE");
        assert!(p.starts_with("EVIDENCE"));
        assert!(p.contains("Data-quality concerns"));
    }
}

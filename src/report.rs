use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Error from the report pipeline, serializable into the IPC error envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ReportError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ReportError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Flat assessment-aspect row as loaded from the workspace db.
#[derive(Debug, Clone)]
pub struct AspectRecord {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub input_type: InputType,
    pub sort_order: i64,
}

/// Flat grade row for one student, pre-joined with the grading teacher.
#[derive(Debug, Clone)]
pub struct GradeRecord {
    pub aspect_id: String,
    pub grade_value: String,
    pub notes: Option<String>,
    pub teacher_id: String,
    pub teacher_name: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Declared value kind of an assessment aspect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    Numeric,
    Letter,
    Binary,
    FreeText,
}

impl InputType {
    pub fn as_str(self) -> &'static str {
        match self {
            InputType::Numeric => "numeric",
            InputType::Letter => "letter",
            InputType::Binary => "binary",
            InputType::FreeText => "free_text",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "numeric" => Some(InputType::Numeric),
            "letter" => Some(InputType::Letter),
            "binary" => Some(InputType::Binary),
            "free_text" => Some(InputType::FreeText),
            _ => None,
        }
    }
}

/// Grade value validated against the aspect's declared input type.
/// The canonical string form is what gets persisted and displayed.
#[derive(Debug, Clone, PartialEq)]
pub enum GradeValue {
    Numeric(f64),
    Letter(String),
    Binary(bool),
    Text(String),
}

impl GradeValue {
    pub fn parse(input_type: InputType, raw: &str) -> Result<Self, ReportError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ReportError::new(
                "invalid_grade_value",
                "grade value must not be empty",
            ));
        }
        match input_type {
            InputType::Numeric => match trimmed.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(GradeValue::Numeric(v)),
                _ => Err(ReportError::new(
                    "invalid_grade_value",
                    format!("'{}' is not a number", trimmed),
                )),
            },
            InputType::Letter => {
                let upper = trimmed.to_ascii_uppercase();
                let mut chars = upper.chars();
                let head_ok = matches!(chars.next(), Some('A'..='F'));
                let tail_ok = matches!(chars.next(), None | Some('+') | Some('-'));
                if head_ok && tail_ok && chars.next().is_none() {
                    Ok(GradeValue::Letter(upper))
                } else {
                    Err(ReportError::new(
                        "invalid_grade_value",
                        format!("'{}' is not a letter grade (A-F, optional +/-)", trimmed),
                    ))
                }
            }
            InputType::Binary => match trimmed.to_ascii_lowercase().as_str() {
                "yes" | "true" | "1" | "ya" => Ok(GradeValue::Binary(true)),
                "no" | "false" | "0" | "tidak" => Ok(GradeValue::Binary(false)),
                _ => Err(ReportError::new(
                    "invalid_grade_value",
                    format!("'{}' is not a yes/no value", trimmed),
                )),
            },
            InputType::FreeText => Ok(GradeValue::Text(trimmed.to_string())),
        }
    }

    pub fn canonical(&self) -> String {
        match self {
            // Whole numbers render without a trailing ".0".
            GradeValue::Numeric(v) => {
                if v.fract() == 0.0 && v.abs() < 1e15 {
                    format!("{}", *v as i64)
                } else {
                    format!("{}", v)
                }
            }
            GradeValue::Letter(s) => s.clone(),
            GradeValue::Binary(true) => "yes".to_string(),
            GradeValue::Binary(false) => "no".to_string(),
            GradeValue::Text(s) => s.clone(),
        }
    }
}

/// One node of the built aspect forest.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AspectNode {
    pub id: String,
    pub name: String,
    pub input_type: &'static str,
    pub order: i64,
    pub children: Vec<AspectNode>,
}

/// Normalized view of one grade, attached to report nodes.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GradeView {
    pub grade_value: String,
    pub notes: Option<String>,
    pub teacher: TeacherRef,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TeacherRef {
    pub id: String,
    pub name: String,
}

/// Aspect node merged with the student's grade for it (if any).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportNode {
    pub id: String,
    pub name: String,
    pub input_type: &'static str,
    pub order: i64,
    pub grade_data: Option<GradeView>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ReportNode>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SummaryStats {
    pub total_aspects: usize,
    pub graded_aspects: usize,
    pub completion_percentage: f64,
    pub average_numeric_score: f64,
    // BTreeMap keeps the serialized key order stable across runs.
    pub grade_distribution: BTreeMap<String, usize>,
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Build the ordered forest from flat aspect rows.
///
/// Roots are rows with no parent; every sibling group (roots included) is
/// sorted ascending by `sort_order`. A parent chain that revisits a node, or
/// a parent reference pointing outside the input set, is reported as
/// `corrupt_hierarchy` instead of recursing forever.
pub fn build_aspect_forest(aspects: &[AspectRecord]) -> Result<Vec<AspectNode>, ReportError> {
    let by_id: HashMap<&str, &AspectRecord> =
        aspects.iter().map(|a| (a.id.as_str(), a)).collect();

    let mut children_of: HashMap<&str, Vec<&AspectRecord>> = HashMap::new();
    let mut roots: Vec<&AspectRecord> = Vec::new();
    for a in aspects {
        match a.parent_id.as_deref() {
            None => roots.push(a),
            Some(pid) => {
                if !by_id.contains_key(pid) {
                    return Err(ReportError::new(
                        "corrupt_hierarchy",
                        format!("aspect {} references missing parent {}", a.id, pid),
                    ));
                }
                children_of.entry(pid).or_default().push(a);
            }
        }
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let forest = emit_siblings(roots, &children_of, &mut visited)?;
    // A cycle has no root, so its members never get visited from the top.
    if visited.len() != aspects.len() {
        let stranded: Vec<&str> = aspects
            .iter()
            .map(|a| a.id.as_str())
            .filter(|id| !visited.contains(id))
            .collect();
        return Err(ReportError::new(
            "corrupt_hierarchy",
            "aspect hierarchy contains a cycle",
        )
        .with_details(serde_json::json!({ "unreachableAspectIds": stranded })));
    }
    Ok(forest)
}

fn emit_siblings<'a>(
    mut group: Vec<&'a AspectRecord>,
    children_of: &HashMap<&'a str, Vec<&'a AspectRecord>>,
    visited: &mut HashSet<&'a str>,
) -> Result<Vec<AspectNode>, ReportError> {
    group.sort_by_key(|a| a.sort_order);
    let mut out = Vec::with_capacity(group.len());
    for a in group {
        if !visited.insert(a.id.as_str()) {
            return Err(ReportError::new(
                "corrupt_hierarchy",
                format!("aspect {} appears twice in the hierarchy", a.id),
            ));
        }
        let kids = children_of
            .get(a.id.as_str())
            .map(|v| v.clone())
            .unwrap_or_default();
        out.push(AspectNode {
            id: a.id.clone(),
            name: a.name.clone(),
            input_type: a.input_type.as_str(),
            order: a.sort_order,
            children: emit_siblings(kids, children_of, visited)?,
        });
    }
    Ok(out)
}

/// Index one student's grades by aspect id.
///
/// The db enforces at most one grade per (student, aspect); if a duplicate
/// slips in anyway, the later row wins. That is a deliberate policy, not an
/// accident of iteration order, so callers should pass rows in created order.
pub fn index_grades_by_aspect(grades: &[GradeRecord]) -> HashMap<String, GradeView> {
    let mut index = HashMap::with_capacity(grades.len());
    for g in grades {
        index.insert(
            g.aspect_id.clone(),
            GradeView {
                grade_value: g.grade_value.clone(),
                notes: g.notes.clone(),
                teacher: TeacherRef {
                    id: g.teacher_id.clone(),
                    name: g.teacher_name.clone(),
                },
                created_at: g.created_at.clone(),
                updated_at: g.updated_at.clone(),
            },
        );
    }
    index
}

/// Attach grade data to every node of the forest, preserving shape and order.
pub fn merge_structure(
    forest: &[AspectNode],
    index: &HashMap<String, GradeView>,
) -> Vec<ReportNode> {
    forest
        .iter()
        .map(|n| ReportNode {
            id: n.id.clone(),
            name: n.name.clone(),
            input_type: n.input_type,
            order: n.order,
            grade_data: index.get(&n.id).cloned(),
            children: merge_structure(&n.children, index),
        })
        .collect()
}

fn count_nodes(forest: &[AspectNode]) -> usize {
    forest.len() + forest.iter().map(|n| count_nodes(&n.children)).sum::<usize>()
}

/// Completion and score statistics over the flat grade collection.
///
/// `graded_aspects` is the raw row count; stale rows can push it (and the
/// completion percentage) past the aspect total, which is left visible as a
/// data-quality signal rather than clamped away.
pub fn summary_stats(grades: &[GradeRecord], forest: &[AspectNode]) -> SummaryStats {
    let total_aspects = count_nodes(forest);
    let graded_aspects = grades.len();

    let completion_percentage = if total_aspects > 0 {
        round2(graded_aspects as f64 / total_aspects as f64 * 100.0)
    } else {
        0.0
    };

    let numeric: Vec<f64> = grades
        .iter()
        .filter_map(|g| g.grade_value.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .collect();
    let average_numeric_score = if numeric.is_empty() {
        0.0
    } else {
        round2(numeric.iter().sum::<f64>() / numeric.len() as f64)
    };

    let mut grade_distribution: BTreeMap<String, usize> = BTreeMap::new();
    for g in grades {
        *grade_distribution.entry(g.grade_value.clone()).or_insert(0) += 1;
    }

    SummaryStats {
        total_aspects,
        graded_aspects,
        completion_percentage,
        average_numeric_score,
        grade_distribution,
    }
}

/// Prune the merged tree by optional aspect-id and teacher-id allow-lists.
///
/// A node failing the aspect filter is dropped with its whole subtree: the
/// recursion only descends into kept nodes. The teacher predicate is applied
/// per node, so a graded child survives under an ungraded ancestor.
pub fn filter_structure(
    nodes: &[ReportNode],
    aspect_ids: Option<&HashSet<String>>,
    teacher_ids: Option<&HashSet<String>>,
) -> Vec<ReportNode> {
    let mut kept = Vec::new();
    for node in nodes {
        if let Some(allowed) = aspect_ids {
            if !allowed.contains(&node.id) {
                continue;
            }
        }
        if let Some(allowed) = teacher_ids {
            if let Some(grade) = &node.grade_data {
                if !allowed.contains(&grade.teacher.id) {
                    continue;
                }
            }
        }
        let mut out = node.clone();
        out.children = filter_structure(&node.children, aspect_ids, teacher_ids);
        kept.push(out);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aspect(id: &str, parent: Option<&str>, order: i64) -> AspectRecord {
        AspectRecord {
            id: id.to_string(),
            parent_id: parent.map(|p| p.to_string()),
            name: format!("Aspect {}", id),
            input_type: InputType::Numeric,
            sort_order: order,
        }
    }

    fn grade(aspect_id: &str, value: &str, teacher_id: &str) -> GradeRecord {
        GradeRecord {
            aspect_id: aspect_id.to_string(),
            grade_value: value.to_string(),
            notes: None,
            teacher_id: teacher_id.to_string(),
            teacher_name: format!("Teacher {}", teacher_id),
            created_at: "2025-03-01T08:00:00Z".to_string(),
            updated_at: "2025-03-01T08:00:00Z".to_string(),
        }
    }

    fn flatten_ids(forest: &[AspectNode], out: &mut Vec<String>) {
        for n in forest {
            out.push(n.id.clone());
            flatten_ids(&n.children, out);
        }
    }

    #[test]
    fn forest_roundtrip_one_root_two_children() {
        let aspects = vec![
            aspect("1", None, 0),
            aspect("2", Some("1"), 1),
            aspect("3", Some("1"), 2),
        ];
        let forest = build_aspect_forest(&aspects).expect("build forest");

        assert_eq!(forest.len(), 1);
        assert_eq!(forest[0].id, "1");
        let child_ids: Vec<&str> = forest[0].children.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(child_ids, vec!["2", "3"]);

        let mut ids = Vec::new();
        flatten_ids(&forest, &mut ids);
        ids.sort();
        assert_eq!(ids, vec!["1", "2", "3"]);
    }

    #[test]
    fn forest_sorts_every_sibling_group_by_order() {
        let aspects = vec![
            aspect("b", None, 2),
            aspect("a", None, 1),
            aspect("b2", Some("b"), 9),
            aspect("b1", Some("b"), 3),
        ];
        let forest = build_aspect_forest(&aspects).expect("build forest");
        let root_ids: Vec<&str> = forest.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(root_ids, vec!["a", "b"]);
        let b_children: Vec<&str> = forest[1].children.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(b_children, vec!["b1", "b2"]);
    }

    #[test]
    fn forest_cycle_is_corrupt_hierarchy_not_a_hang() {
        let aspects = vec![
            aspect("1", Some("2"), 0),
            aspect("2", Some("1"), 1),
            aspect("3", None, 2),
        ];
        let err = build_aspect_forest(&aspects).expect_err("cycle must fail");
        assert_eq!(err.code, "corrupt_hierarchy");
    }

    #[test]
    fn forest_missing_parent_is_corrupt_hierarchy() {
        let aspects = vec![aspect("1", Some("ghost"), 0)];
        let err = build_aspect_forest(&aspects).expect_err("dangling parent must fail");
        assert_eq!(err.code, "corrupt_hierarchy");
    }

    #[test]
    fn merge_is_total_and_matches_exactly() {
        let aspects = vec![
            aspect("1", None, 0),
            aspect("2", Some("1"), 0),
            aspect("3", Some("1"), 1),
        ];
        let forest = build_aspect_forest(&aspects).expect("build forest");
        let grades = vec![grade("2", "90", "t1")];
        let index = index_grades_by_aspect(&grades);
        let merged = merge_structure(&forest, &index);

        assert_eq!(merged.len(), 1);
        assert!(merged[0].grade_data.is_none());
        assert_eq!(merged[0].children.len(), 2);
        let graded = &merged[0].children[0];
        assert_eq!(graded.id, "2");
        assert_eq!(
            graded.grade_data.as_ref().map(|g| g.grade_value.as_str()),
            Some("90")
        );
        assert!(merged[0].children[1].grade_data.is_none());
    }

    #[test]
    fn index_last_write_wins_on_duplicate_aspect() {
        let grades = vec![grade("1", "70", "t1"), grade("1", "95", "t2")];
        let index = index_grades_by_aspect(&grades);
        assert_eq!(index.len(), 1);
        assert_eq!(index["1"].grade_value, "95");
        assert_eq!(index["1"].teacher.id, "t2");
    }

    #[test]
    fn total_aspects_matches_direct_recursive_count() {
        let aspects = vec![
            aspect("1", None, 0),
            aspect("2", Some("1"), 0),
            aspect("3", Some("2"), 0),
            aspect("4", None, 1),
        ];
        let forest = build_aspect_forest(&aspects).expect("build forest");
        let stats = summary_stats(&[], &forest);
        let mut ids = Vec::new();
        flatten_ids(&forest, &mut ids);
        assert_eq!(stats.total_aspects, ids.len());
        assert_eq!(stats.total_aspects, 4);
    }

    #[test]
    fn completion_percentage_half_graded_is_exactly_50() {
        let aspects = vec![
            aspect("1", None, 0),
            aspect("2", None, 1),
            aspect("3", None, 2),
            aspect("4", None, 3),
        ];
        let forest = build_aspect_forest(&aspects).expect("build forest");
        let grades = vec![grade("1", "80", "t1"), grade("2", "90", "t1")];
        let stats = summary_stats(&grades, &forest);
        assert_eq!(stats.completion_percentage, 50.0);
    }

    #[test]
    fn empty_forest_yields_zeroed_stats_without_division_fault() {
        let stats = summary_stats(&[grade("1", "80", "t1")], &[]);
        assert_eq!(stats.total_aspects, 0);
        assert_eq!(stats.graded_aspects, 1);
        assert_eq!(stats.completion_percentage, 0.0);
    }

    #[test]
    fn completion_percentage_is_not_clamped_to_100() {
        let forest = build_aspect_forest(&[aspect("1", None, 0)]).expect("build forest");
        let grades = vec![grade("1", "80", "t1"), grade("stale", "70", "t1")];
        let stats = summary_stats(&grades, &forest);
        assert_eq!(stats.graded_aspects, 2);
        assert_eq!(stats.completion_percentage, 200.0);
    }

    #[test]
    fn average_skips_non_numeric_values_entirely() {
        let grades = vec![
            grade("1", "80", "t1"),
            grade("2", "90", "t1"),
            grade("3", "A", "t1"),
            grade("4", "Tidak", "t1"),
        ];
        let stats = summary_stats(&grades, &[]);
        assert_eq!(stats.average_numeric_score, 85.0);
    }

    #[test]
    fn average_is_zero_when_no_numeric_grades() {
        let grades = vec![grade("1", "A", "t1")];
        let stats = summary_stats(&grades, &[]);
        assert_eq!(stats.average_numeric_score, 0.0);
    }

    #[test]
    fn grade_distribution_counts_raw_values() {
        let grades = vec![
            grade("1", "A", "t1"),
            grade("2", "A", "t2"),
            grade("3", "80", "t1"),
        ];
        let stats = summary_stats(&grades, &[]);
        assert_eq!(stats.grade_distribution["A"], 2);
        assert_eq!(stats.grade_distribution["80"], 1);
    }

    #[test]
    fn summary_stats_serialize_byte_identical() {
        let values = [
            "A", "B+", "C-", "80", "85.5", "90", "yes", "no", "ok", "D", "F", "100",
        ];
        let grades: Vec<GradeRecord> = values
            .iter()
            .enumerate()
            .map(|(i, v)| grade(&format!("a{}", i), v, "t1"))
            .collect();
        let s1 = serde_json::to_string(&summary_stats(&grades, &[])).expect("serialize");
        let s2 = serde_json::to_string(&summary_stats(&grades, &[])).expect("serialize");
        assert_eq!(s1, s2);
    }

    fn merged_three_roots() -> Vec<ReportNode> {
        let aspects = vec![
            aspect("1", None, 0),
            aspect("2", None, 1),
            aspect("2a", Some("2"), 0),
            aspect("3", None, 2),
        ];
        let forest = build_aspect_forest(&aspects).expect("build forest");
        let grades = vec![grade("2a", "90", "t1"), grade("3", "80", "t2")];
        merge_structure(&forest, &index_grades_by_aspect(&grades))
    }

    #[test]
    fn aspect_filter_keeps_one_root_with_subtree_untouched() {
        let merged = merged_three_roots();
        let allowed: HashSet<String> = ["2".to_string(), "2a".to_string()].into_iter().collect();
        let filtered = filter_structure(&merged, Some(&allowed), None);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "2");
        assert_eq!(filtered[0].children.len(), 1);
        assert_eq!(filtered[0].children[0].id, "2a");
    }

    // Regression pin: a root outside the aspect allow-list drops its whole
    // subtree, even when descendants would have matched on their own.
    #[test]
    fn aspect_filter_hard_prunes_non_matching_ancestors() {
        let merged = merged_three_roots();
        let allowed: HashSet<String> = ["2a".to_string()].into_iter().collect();
        let filtered = filter_structure(&merged, Some(&allowed), None);
        assert!(filtered.is_empty());
    }

    #[test]
    fn teacher_filter_keeps_ungraded_nodes_and_checks_per_node() {
        let merged = merged_three_roots();
        let allowed: HashSet<String> = ["t1".to_string()].into_iter().collect();
        let filtered = filter_structure(&merged, None, Some(&allowed));
        // Root 1 has no grade (kept), root 2 has no grade but its child was
        // graded by t1 (both kept), root 3 was graded by t2 (dropped).
        let ids: Vec<&str> = filtered.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(filtered[1].children[0].id, "2a");
    }

    #[test]
    fn grade_value_numeric_accepts_numbers_only() {
        assert_eq!(
            GradeValue::parse(InputType::Numeric, " 85 ").expect("parse").canonical(),
            "85"
        );
        assert_eq!(
            GradeValue::parse(InputType::Numeric, "85.5").expect("parse").canonical(),
            "85.5"
        );
        assert!(GradeValue::parse(InputType::Numeric, "A").is_err());
        assert!(GradeValue::parse(InputType::Numeric, "NaN").is_err());
    }

    #[test]
    fn grade_value_letter_canonicalizes_case() {
        assert_eq!(
            GradeValue::parse(InputType::Letter, "b+").expect("parse").canonical(),
            "B+"
        );
        assert!(GradeValue::parse(InputType::Letter, "G").is_err());
        assert!(GradeValue::parse(InputType::Letter, "AB").is_err());
    }

    #[test]
    fn grade_value_binary_canonicalizes_to_yes_no() {
        assert_eq!(
            GradeValue::parse(InputType::Binary, "Ya").expect("parse").canonical(),
            "yes"
        );
        assert_eq!(
            GradeValue::parse(InputType::Binary, "tidak").expect("parse").canonical(),
            "no"
        );
        assert!(GradeValue::parse(InputType::Binary, "maybe").is_err());
    }

    #[test]
    fn grade_value_rejects_empty_input() {
        assert!(GradeValue::parse(InputType::FreeText, "   ").is_err());
    }
}

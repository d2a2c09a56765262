//! Planning-document parser.
//!
//! Extraction is line oriented and tolerant of markdown decoration
//! (heading markers, bold, checkboxes). Recognized constructs:
//!
//! - sprint headers: `Sprint <n>: <name> [(<duration>)]`
//! - explicit task headers: `Task <sprint>.<index>: <name>`
//! - numbered task items: `<index>. **<name>** - <description>`
//! - labeled sections: acceptance criteria, steps, gate requirements
//! - `Agent:` / `Skill:` metadata lines inside a task
//! - an agent-mapping table with sprint/task/agent/skill columns
//!
//! Validation runs after extraction and reports every violation at once.
//! Dependencies are never read from the document: each task depends on
//! the previous task of its sprint, the first task of sprint N depends on
//! gate N-1, and each gate depends on every task of its sprint.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;

use super::error::{ParseError, ParseWarning, Violation};
use super::model::{Gate, NodeId, Plan, Slot, Sprint, Task};

static SPRINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:#{1,6}\s+)?(?:\*\*)?\s*sprint\s+(\d+)\s*:\s*(.*?)\s*$")
        .expect("sprint header regex is valid")
});

static TASK_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(#{0,6})\s*(?:\*\*)?\s*task\s+(\d+)\.(\d+)\s*:\s*(.+?)\s*$")
        .expect("task header regex is valid")
});

static NUMBERED_TASK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)\.\s+\*\*(.+?)\*\*\s*(.*)$").expect("numbered task regex is valid")
});

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(#{1,6})\s+(.+?)\s*#*\s*$").expect("heading regex is valid"));

static CHECKBOX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*)[-*+]\s+\[[ xX]\]\s+(.+?)\s*$").expect("checkbox regex is valid")
});

static LIST_ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*)(?:[-*+]|\d+[.)])\s+(.+?)\s*$").expect("list item regex is valid")
});

static METADATA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(?:[-*+]\s+)?(?:\*\*)?(agent|skill)(?:\*\*)?\s*:\s*(?:\*\*)?\s*(.+?)\s*$")
        .expect("metadata regex is valid")
});

/// Parse a planning document into a validated [`Plan`].
///
/// Returns every structural violation in a single [`ParseError`]. Missing
/// acceptance criteria, gate requirements, or tasks are reported as
/// warnings on the returned plan instead.
pub fn parse(text: &str) -> Result<Plan, ParseError> {
    let mut extractor = Extractor::default();
    for (idx, line) in text.lines().enumerate() {
        extractor.feed(idx + 1, line);
    }
    extractor.finish()
}

// ---------------------------------------------------------------------------
// Extraction state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Section {
    #[default]
    None,
    TaskSteps,
    TaskCriteria,
    SprintCriteria,
    GateRequirements,
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    AcceptanceCriteria,
    SprintCriteria,
    Gate,
    Steps,
    AgentMapping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskForm {
    /// `Task X.Y:` header; `level` is the number of `#` markers (0 if none).
    Header { level: usize },
    Numbered,
}

#[derive(Debug)]
struct TaskDraft {
    index: u32,
    name: String,
    line: usize,
    form: TaskForm,
    description: Vec<String>,
    steps: Vec<String>,
    criteria: Vec<String>,
    agent: Option<String>,
    skill: Option<String>,
}

#[derive(Debug)]
struct SprintDraft {
    number: u32,
    name: String,
    duration: Option<String>,
    line: usize,
    description: Vec<String>,
    criteria: Vec<String>,
    gate: Vec<String>,
    tasks: Vec<TaskDraft>,
}

#[derive(Debug)]
struct MappingColumns {
    sprint: Option<usize>,
    task: usize,
    agent: usize,
    skill: Option<usize>,
    seen_separator: bool,
}

#[derive(Debug)]
struct MappingRow {
    line: usize,
    target: Option<NodeId>,
    raw: String,
    agent: Option<String>,
    skill: Option<String>,
}

#[derive(Debug, Default)]
struct Extractor {
    title: Option<String>,
    sprints: Vec<SprintDraft>,
    task_open: bool,
    section: Section,
    table: Option<MappingColumns>,
    mappings: Vec<MappingRow>,
    violations: Vec<Violation>,
}

impl Extractor {
    fn feed(&mut self, line_no: usize, line: &str) {
        let trimmed = line.trim();

        if trimmed.starts_with('|') {
            if self.feed_table_line(line_no, trimmed) {
                return;
            }
        } else {
            self.table = None;
        }

        if trimmed.is_empty() {
            return;
        }

        if let Some(caps) = SPRINT_RE.captures(line) {
            // The regex guarantees a digit run; overflow is the only failure.
            if let Ok(number) = caps[1].parse() {
                self.open_sprint(number, &caps[2], line_no);
                return;
            }
        }

        if let Some(caps) = TASK_HEADER_RE.captures(line) {
            if let (Ok(sprint), Ok(index)) = (caps[2].parse(), caps[3].parse()) {
                let level = caps[1].len();
                self.open_header_task(sprint, index, clean_name(&caps[4]), level, line_no);
                return;
            }
        }

        if let Some(label) = label_of(trimmed) {
            self.open_section(label, heading_level(trimmed));
            return;
        }

        if let Some(caps) = HEADING_RE.captures(line) {
            self.plain_heading(caps[1].len(), &caps[2]);
            return;
        }

        if self.accepts_numbered_task() {
            if let Some(caps) = NUMBERED_TASK_RE.captures(line) {
                if let Ok(index) = caps[1].parse() {
                    let rest = caps[3].trim_start_matches(['-', ':', '–', '—', ' ']).trim();
                    self.open_numbered_task(index, clean_name(&caps[2]), rest, line_no);
                    return;
                }
            }
        }

        if self.task_open {
            if let Some(caps) = METADATA_RE.captures(line) {
                let value = caps[2].trim_matches(['`', '*', ' ']).to_string();
                if let Some(task) = self.current_task_mut() {
                    if caps[1].eq_ignore_ascii_case("agent") {
                        task.agent = Some(value);
                    } else {
                        task.skill = Some(value);
                    }
                }
                return;
            }
        }

        if let Some(caps) = CHECKBOX_RE.captures(line) {
            if self.push_item(&caps[2], true, caps[1].len()) {
                return;
            }
        } else if let Some(caps) = LIST_ITEM_RE.captures(line) {
            if self.push_item(&caps[2], false, caps[1].len()) {
                return;
            }
        }

        self.push_text(trimmed);
    }

    // -- structure ----------------------------------------------------------

    fn open_sprint(&mut self, number: u32, rest: &str, line: usize) {
        let rest = rest.trim().trim_end_matches('*').trim();
        let (name, duration) = split_duration(rest);
        let name = if name.is_empty() {
            format!("Sprint {number}")
        } else {
            name
        };
        self.sprints.push(SprintDraft {
            number,
            name,
            duration,
            line,
            description: Vec::new(),
            criteria: Vec::new(),
            gate: Vec::new(),
            tasks: Vec::new(),
        });
        self.task_open = false;
        self.section = Section::None;
    }

    fn open_header_task(&mut self, sprint: u32, index: u32, name: String, level: usize, line: usize) {
        let id = NodeId::task(sprint, index);
        let current = match self.sprints.last() {
            None => {
                self.violations
                    .push(Violation::TaskOutsideSprint { name, line });
                self.close_task(Section::Ignore);
                return;
            }
            Some(current) => current.number,
        };
        if current != sprint {
            self.violations.push(Violation::SprintMismatch {
                id,
                sprint: current,
                line,
            });
            self.close_task(Section::Ignore);
            return;
        }
        self.push_task(TaskDraft::new(index, name, line, TaskForm::Header { level }));
    }

    fn open_numbered_task(&mut self, index: u32, name: String, rest: &str, line: usize) {
        let mut draft = TaskDraft::new(index, name, line, TaskForm::Numbered);
        if !rest.is_empty() {
            draft.description.push(rest.to_string());
        }
        self.push_task(draft);
    }

    fn push_task(&mut self, draft: TaskDraft) {
        if let Some(sprint) = self.sprints.last_mut() {
            sprint.tasks.push(draft);
            self.task_open = true;
            self.section = Section::None;
        }
    }

    fn close_task(&mut self, section: Section) {
        self.task_open = false;
        self.section = section;
    }

    fn accepts_numbered_task(&self) -> bool {
        if self.sprints.is_empty() {
            return false;
        }
        // Inside an explicit `Task X.Y` body, numbered bold items are steps.
        !matches!(
            self.current_task().map(|t| t.form),
            Some(TaskForm::Header { .. })
        )
    }

    fn open_section(&mut self, label: Label, level: usize) {
        if self.sprints.is_empty() {
            self.section = Section::Ignore;
            return;
        }
        match label {
            Label::AgentMapping => self.close_task(Section::Ignore),
            Label::Steps if self.task_open => self.section = Section::TaskSteps,
            Label::Steps => self.section = Section::Ignore,
            Label::AcceptanceCriteria if self.task_scope_allows(level) => {
                self.section = Section::TaskCriteria;
            }
            Label::AcceptanceCriteria | Label::SprintCriteria => {
                self.close_task(Section::SprintCriteria);
            }
            Label::Gate => self.close_task(Section::GateRequirements),
        }
    }

    /// Whether a labeled section at heading `level` still belongs to the
    /// open task rather than the sprint.
    fn task_scope_allows(&self, level: usize) -> bool {
        if !self.task_open {
            return false;
        }
        if level == 0 {
            return true;
        }
        match self.current_task().map(|t| t.form) {
            Some(TaskForm::Header { level: task_level }) => task_level == 0 || level > task_level,
            _ => false,
        }
    }

    fn plain_heading(&mut self, level: usize, text: &str) {
        if level == 1 && self.title.is_none() {
            self.title = Some(clean_name(text));
        }
        self.close_task(Section::None);
    }

    // -- content ------------------------------------------------------------

    /// Route a list or checkbox item by the active section. Returns `false`
    /// when the item should be treated as plain text instead.
    fn push_item(&mut self, text: &str, checkbox: bool, indent: usize) -> bool {
        let text = text.trim().to_string();
        match self.section {
            Section::Ignore => {}
            Section::TaskSteps => match self.current_task_mut() {
                Some(task) => task.steps.push(text),
                None => return false,
            },
            Section::TaskCriteria => match self.current_task_mut() {
                Some(task) => task.criteria.push(text),
                None => return false,
            },
            Section::SprintCriteria => match self.sprints.last_mut() {
                Some(sprint) => sprint.criteria.push(text),
                None => return false,
            },
            Section::GateRequirements => match self.sprints.last_mut() {
                Some(sprint) => sprint.gate.push(text),
                None => return false,
            },
            Section::None => {
                let numbered = matches!(
                    self.current_task().map(|t| t.form),
                    Some(TaskForm::Numbered)
                );
                if !(numbered && indent > 0 && !checkbox) {
                    return false;
                }
                if let Some(task) = self.current_task_mut() {
                    task.steps.push(text);
                }
            }
        }
        true
    }

    fn push_text(&mut self, text: &str) {
        if self.section == Section::Ignore {
            return;
        }
        if let Some(task) = self.current_task_mut() {
            task.description.push(text.to_string());
        } else if let Some(sprint) = self.sprints.last_mut() {
            sprint.description.push(text.to_string());
        }
    }

    fn current_task(&self) -> Option<&TaskDraft> {
        if !self.task_open {
            return None;
        }
        self.sprints.last()?.tasks.last()
    }

    fn current_task_mut(&mut self) -> Option<&mut TaskDraft> {
        if !self.task_open {
            return None;
        }
        self.sprints.last_mut()?.tasks.last_mut()
    }

    // -- agent mapping table ------------------------------------------------

    fn feed_table_line(&mut self, line_no: usize, line: &str) -> bool {
        let cells = table_cells(line);

        let Some(columns) = self.table.as_mut() else {
            return match mapping_columns(&cells) {
                Some(columns) => {
                    self.table = Some(columns);
                    true
                }
                None => false,
            };
        };

        if !columns.seen_separator && cells.iter().all(|c| is_separator_cell(c)) {
            columns.seen_separator = true;
            return true;
        }

        let cell = |idx: Option<usize>| -> Option<String> {
            let value = cells.get(idx?)?.trim_matches(['`', '*', ' ']);
            (!value.is_empty() && value != "-").then(|| value.to_string())
        };

        let raw = cell(Some(columns.task)).unwrap_or_default();
        let target = raw.parse::<NodeId>().ok().or_else(|| {
            let index: u32 = raw.parse().ok()?;
            let sprint: u32 = cell(columns.sprint)?.parse().ok()?;
            Some(NodeId::task(sprint, index))
        });
        let row = MappingRow {
            line: line_no,
            target,
            raw,
            agent: cell(Some(columns.agent)),
            skill: cell(columns.skill),
        };
        self.mappings.push(row);
        true
    }

    // -- validation ---------------------------------------------------------

    fn finish(self) -> Result<Plan, ParseError> {
        let Extractor {
            title,
            mut sprints,
            mappings,
            mut violations,
            ..
        } = self;

        if sprints.is_empty() {
            violations.push(Violation::NoSprints);
        }

        let mut sprint_lines: BTreeMap<u32, usize> = BTreeMap::new();
        for sprint in &sprints {
            match sprint_lines.get(&sprint.number) {
                Some(&first_line) => violations.push(Violation::DuplicateSprint {
                    number: sprint.number,
                    first_line,
                    line: sprint.line,
                }),
                None => {
                    sprint_lines.insert(sprint.number, sprint.line);
                }
            }
        }
        let mut expected = 0u32;
        for &number in sprint_lines.keys() {
            if number > expected {
                push_gap(&mut violations, expected, number - 1);
            }
            expected = number.saturating_add(1);
        }

        let mut task_lines: BTreeMap<NodeId, usize> = BTreeMap::new();
        for sprint in &sprints {
            for task in &sprint.tasks {
                let id = NodeId::task(sprint.number, task.index);
                match task_lines.get(&id) {
                    Some(&first_line) => violations.push(Violation::DuplicateTask {
                        id,
                        first_line,
                        line: task.line,
                    }),
                    None => {
                        task_lines.insert(id, task.line);
                    }
                }
            }
        }

        if !violations.is_empty() {
            return Err(ParseError { violations });
        }

        let mut warnings = Vec::new();
        if title.is_none() {
            warnings.push(ParseWarning::MissingTitle);
        }

        let mut mapping_warnings = Vec::new();
        for row in mappings {
            let task = match row.target {
                Some(id) => find_task(&mut sprints, id),
                None => None,
            };
            match task {
                Some(task) => {
                    if row.agent.is_some() {
                        task.agent = row.agent;
                    }
                    if row.skill.is_some() {
                        task.skill = row.skill;
                    }
                }
                None => mapping_warnings.push(ParseWarning::UnknownMappingTarget {
                    line: row.line,
                    target: row.raw,
                }),
            }
        }

        sprints.sort_by_key(|s| s.number);
        let mut built: Vec<Sprint> = sprints.into_iter().map(build_sprint).collect();
        link_blocks(&mut built);

        for sprint in &built {
            if sprint.tasks.is_empty() {
                warnings.push(ParseWarning::EmptySprint {
                    sprint: sprint.number,
                });
            }
            if sprint.acceptance_criteria.is_empty() {
                warnings.push(ParseWarning::NoAcceptanceCriteria {
                    sprint: sprint.number,
                });
            }
            if sprint.gate.requirements.is_empty() {
                warnings.push(ParseWarning::NoGateRequirements {
                    sprint: sprint.number,
                });
            }
        }
        warnings.extend(mapping_warnings);

        Ok(Plan {
            title: title.unwrap_or_else(|| "Untitled plan".to_string()),
            sprints: built,
            warnings,
        })
    }
}

impl TaskDraft {
    fn new(index: u32, name: String, line: usize, form: TaskForm) -> Self {
        Self {
            index,
            name,
            line,
            form,
            description: Vec::new(),
            steps: Vec::new(),
            criteria: Vec::new(),
            agent: None,
            skill: None,
        }
    }
}

fn find_task(sprints: &mut [SprintDraft], id: NodeId) -> Option<&mut TaskDraft> {
    let Slot::Task(index) = id.slot else {
        return None;
    };
    sprints
        .iter_mut()
        .find(|s| s.number == id.sprint)?
        .tasks
        .iter_mut()
        .find(|t| t.index == index)
}

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

fn build_sprint(draft: SprintDraft) -> Sprint {
    let number = draft.number;
    let previous_gate = number.checked_sub(1).map(NodeId::gate);

    let mut tasks = Vec::with_capacity(draft.tasks.len());
    let mut previous: Option<NodeId> = None;
    for task in draft.tasks {
        let id = NodeId::task(number, task.index);
        let depends_on: BTreeSet<NodeId> = previous.or(previous_gate).into_iter().collect();
        previous = Some(id);
        tasks.push(Task {
            id,
            name: task.name,
            description: task.description.join("\n"),
            steps: task.steps,
            acceptance_criteria: task.criteria,
            agent: task.agent,
            skill: task.skill,
            depends_on,
            blocks: BTreeSet::new(),
        });
    }

    let mut gate_deps: BTreeSet<NodeId> = tasks.iter().map(|t| t.id).collect();
    if gate_deps.is_empty() {
        gate_deps.extend(previous_gate);
    }

    Sprint {
        number,
        name: draft.name,
        duration: draft.duration,
        description: draft.description.join("\n"),
        tasks,
        acceptance_criteria: draft.criteria,
        gate: Gate {
            id: NodeId::gate(number),
            requirements: draft.gate,
            depends_on: gate_deps,
            blocks: BTreeSet::new(),
        },
    }
}

/// Fill every node's `blocks` set as the inverse of the dependency edges.
fn link_blocks(sprints: &mut [Sprint]) {
    let mut blocks: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
    for sprint in sprints.iter() {
        for task in &sprint.tasks {
            for dep in &task.depends_on {
                blocks.entry(*dep).or_default().insert(task.id);
            }
        }
        for dep in &sprint.gate.depends_on {
            blocks.entry(*dep).or_default().insert(sprint.gate.id);
        }
    }
    for sprint in sprints.iter_mut() {
        for task in &mut sprint.tasks {
            task.blocks = blocks.remove(&task.id).unwrap_or_default();
        }
        sprint.gate.blocks = blocks.remove(&sprint.gate.id).unwrap_or_default();
    }
}

// ---------------------------------------------------------------------------
// Line helpers
// ---------------------------------------------------------------------------

fn clean_name(raw: &str) -> String {
    raw.trim()
        .trim_matches('*')
        .trim()
        .trim_end_matches(':')
        .trim()
        .to_string()
}

fn split_duration(rest: &str) -> (String, Option<String>) {
    if rest.ends_with(')') {
        if let Some(open) = rest.rfind('(') {
            let duration = rest[open + 1..rest.len() - 1].trim();
            let name = rest[..open].trim();
            if !duration.is_empty() {
                return (name.to_string(), Some(duration.to_string()));
            }
        }
    }
    (rest.to_string(), None)
}

fn heading_level(line: &str) -> usize {
    line.chars().take_while(|c| *c == '#').count()
}

fn label_of(line: &str) -> Option<Label> {
    let normalized = line
        .trim_start_matches('#')
        .trim()
        .trim_matches('*')
        .trim()
        .trim_end_matches(':')
        .trim_matches('*')
        .trim()
        .to_lowercase();
    match normalized.as_str() {
        "acceptance criteria" | "acceptance" => Some(Label::AcceptanceCriteria),
        "sprint acceptance criteria" => Some(Label::SprintCriteria),
        "gate" | "sprint gate" | "gate criteria" | "gate requirements" | "quality gate"
        | "definition of done" => Some(Label::Gate),
        "steps" | "implementation steps" => Some(Label::Steps),
        "agent mapping" | "agent mappings" | "agent assignments" => Some(Label::AgentMapping),
        _ => None,
    }
}

fn table_cells(line: &str) -> Vec<String> {
    let inner = line.trim().trim_start_matches('|').trim_end_matches('|');
    inner.split('|').map(|c| c.trim().to_string()).collect()
}

fn is_separator_cell(cell: &str) -> bool {
    let cell = cell.trim();
    !cell.is_empty() && cell.chars().all(|c| c == '-' || c == ':')
}

fn mapping_columns(header: &[String]) -> Option<MappingColumns> {
    let find = |needle: &str| {
        header
            .iter()
            .position(|cell| cell.to_lowercase().contains(needle))
    };
    Some(MappingColumns {
        sprint: find("sprint"),
        task: find("task")?,
        agent: find("agent")?,
        skill: find("skill"),
        seen_separator: false,
    })
}

/// Gaps longer than this are reported as one range.
const MAX_LISTED_GAP: u32 = 8;

fn push_gap(violations: &mut Vec<Violation>, first: u32, last: u32) {
    if last - first < MAX_LISTED_GAP {
        violations.extend((first..=last).map(Violation::MissingSprint));
    } else {
        violations.push(Violation::MissingSprints { first, last });
    }
}

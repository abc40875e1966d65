use serde::{Deserialize, Serialize};

use crate::approvals::{validate, ValidationError};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RuleId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApproverId(pub String);

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Display for ApproverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approver {
    pub id: ApproverId,
    pub name: String,
    pub required: bool,
}

impl Approver {
    pub fn new(id: impl Into<String>, name: impl Into<String>, required: bool) -> Self {
        Self { id: ApproverId(id.into()), name: name.into(), required }
    }
}

/// An approval rule as configured by an administrator.
///
/// A stored revision never changes. Editing a rule produces the next revision,
/// and ledgers keep pointing at the revision they were seeded from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDefinition {
    pub id: RuleId,
    #[serde(default = "first_revision")]
    pub revision: u32,
    #[serde(default)]
    pub description: String,
    /// User the rule was configured for, when it is not a shared rule.
    #[serde(default)]
    pub applies_to: Option<String>,
    #[serde(default)]
    pub manager: Option<Approver>,
    #[serde(default)]
    pub manager_is_approver: bool,
    #[serde(default)]
    pub sequential: bool,
    pub min_approval_percentage: i32,
    #[serde(default)]
    pub approvers: Vec<Approver>,
}

fn first_revision() -> u32 {
    1
}

impl RuleDefinition {
    pub fn builder(id: impl Into<String>) -> RuleDefinitionBuilder {
        RuleDefinitionBuilder::new(id)
    }

    /// Approvers in ledger order: the manager first when it acts as an
    /// approver, then the declared list.
    pub fn effective_approvers(&self) -> impl Iterator<Item = &Approver> {
        let manager = if self.manager_is_approver { self.manager.as_ref() } else { None };
        manager.into_iter().chain(self.approvers.iter())
    }

    pub fn approver(&self, id: &ApproverId) -> Option<&Approver> {
        self.effective_approvers().find(|approver| &approver.id == id)
    }

    pub fn is_required(&self, id: &ApproverId) -> bool {
        self.approver(id).map(|approver| approver.required).unwrap_or(false)
    }

    /// Copy of this rule carrying the given revision number.
    pub fn with_revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }
}

#[derive(Clone, Debug)]
pub struct RuleDefinitionBuilder {
    rule: RuleDefinition,
}

pub const DEFAULT_MIN_APPROVAL_PERCENTAGE: i32 = 100;

impl RuleDefinitionBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            rule: RuleDefinition {
                id: RuleId(id.into()),
                revision: first_revision(),
                description: String::new(),
                applies_to: None,
                manager: None,
                manager_is_approver: false,
                sequential: false,
                min_approval_percentage: DEFAULT_MIN_APPROVAL_PERCENTAGE,
                approvers: Vec::new(),
            },
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.rule.description = description.into();
        self
    }

    pub fn applies_to(mut self, user: impl Into<String>) -> Self {
        self.rule.applies_to = Some(user.into());
        self
    }

    pub fn manager(mut self, manager: Approver) -> Self {
        self.rule.manager = Some(manager);
        self
    }

    pub fn manager_is_approver(mut self, manager_is_approver: bool) -> Self {
        self.rule.manager_is_approver = manager_is_approver;
        self
    }

    pub fn sequential(mut self, sequential: bool) -> Self {
        self.rule.sequential = sequential;
        self
    }

    pub fn min_approval_percentage(mut self, percentage: i32) -> Self {
        self.rule.min_approval_percentage = percentage;
        self
    }

    pub fn approver(mut self, approver: Approver) -> Self {
        self.rule.approvers.push(approver);
        self
    }

    pub fn approvers(mut self, approvers: impl IntoIterator<Item = Approver>) -> Self {
        self.rule.approvers.extend(approvers);
        self
    }

    pub fn build(self) -> Result<RuleDefinition, ValidationError> {
        validate(&self.rule)?;
        Ok(self.rule)
    }
}

/// Raw state of the admin approval-rules form.
///
/// The percentage arrives as text and approver rows may be blank; blank rows
/// are dropped and ids trimmed before validation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuleDraft {
    pub id: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub manager: Option<Approver>,
    #[serde(default)]
    pub is_manager_approver: bool,
    #[serde(default)]
    pub sequential_approval: bool,
    #[serde(default)]
    pub min_approval_percentage: Option<String>,
    #[serde(default)]
    pub approvers: Vec<Approver>,
}

impl RuleDraft {
    /// Converts the form into a validated rule. `default_percentage` applies
    /// when the percentage field was left empty.
    pub fn into_rule(self, default_percentage: i32) -> Result<RuleDefinition, ValidationError> {
        let percentage = match self.min_approval_percentage.as_deref().map(str::trim) {
            None | Some("") => default_percentage,
            Some(raw) => raw
                .parse::<i32>()
                .map_err(|_| ValidationError::UnparseablePercentage { raw: raw.to_string() })?,
        };

        let approvers = self
            .approvers
            .into_iter()
            .map(trimmed)
            .filter(|approver| !approver.id.0.is_empty() || !approver.name.is_empty());

        let mut builder = RuleDefinition::builder(self.id)
            .description(self.description)
            .manager_is_approver(self.is_manager_approver)
            .sequential(self.sequential_approval)
            .min_approval_percentage(percentage)
            .approvers(approvers);
        if let Some(manager) = self.manager {
            builder = builder.manager(trimmed(manager));
        }
        let user = self.user.trim();
        if !user.is_empty() {
            builder = builder.applies_to(user);
        }

        builder.build()
    }
}

fn trimmed(approver: Approver) -> Approver {
    Approver {
        id: ApproverId(approver.id.0.trim().to_string()),
        name: approver.name.trim().to_string(),
        required: approver.required,
    }
}

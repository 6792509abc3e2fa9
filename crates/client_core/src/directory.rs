use shared::{
    domain::{ConversationSelection, Correspondent, UserId},
    error::NotFoundError,
};

/// Roster of correspondents plus the currently selected one.
#[derive(Debug, Default, Clone)]
pub struct ConversationDirectory {
    roster: Vec<Correspondent>,
    selected: Option<ConversationSelection>,
}

impl ConversationDirectory {
    pub fn new(roster: Vec<Correspondent>) -> Self {
        Self {
            roster,
            selected: None,
        }
    }

    /// Roster in source order.
    pub fn list(&self) -> &[Correspondent] {
        &self.roster
    }

    pub fn get(&self, id: UserId) -> Option<&Correspondent> {
        self.roster.iter().find(|correspondent| correspondent.id == id)
    }

    pub fn select(&mut self, id: UserId) -> Result<Correspondent, NotFoundError> {
        let correspondent = self.get(id).cloned().ok_or(NotFoundError(id))?;
        if self.selected.as_ref().map(|s| s.recipient_id) != Some(id) {
            self.selected = Some(ConversationSelection::from(&correspondent));
        }
        Ok(correspondent)
    }

    pub fn selected(&self) -> Option<&ConversationSelection> {
        self.selected.as_ref()
    }

    pub fn clear_selection(&mut self) {
        self.selected = None;
    }
}

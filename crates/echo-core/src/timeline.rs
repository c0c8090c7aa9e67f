use std::collections::BTreeMap;

use crate::{
    error::{EchoError, EchoErrorCategory},
    types::{Post, PostEvent, ReactionType, TimelineSnapshot},
};

/// Hard ceiling on a single timeline page request.
pub const MAX_PAGE_LIMIT: u16 = 100;

/// Mutation a reaction click resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionToggle {
    /// Apply this reaction, replacing any other one on the post.
    Add(ReactionType),
    /// Remove the reaction currently applied to the post.
    Remove,
}

impl ReactionToggle {
    /// Reaction left on the post once the toggle succeeds.
    pub fn resulting_reaction(self) -> Option<ReactionType> {
        match self {
            Self::Add(reaction) => Some(reaction),
            Self::Remove => None,
        }
    }
}

/// Feed view state: server pages, realtime posts and the user's reactions.
///
/// Every post ID appears at most once across both sets.
#[derive(Debug, Clone)]
pub struct TimelineState {
    server_posts: Vec<Post>,
    realtime_posts: Vec<Post>,
    user_reactions: BTreeMap<String, ReactionType>,
    error: Option<EchoError>,
    max_items: usize,
}

impl TimelineState {
    /// Create an empty timeline with a retention cap (`max_items >= 1`).
    pub fn new(max_items: usize) -> Self {
        Self {
            server_posts: Vec::new(),
            realtime_posts: Vec::new(),
            user_reactions: BTreeMap::new(),
            error: None,
            max_items: max_items.max(1),
        }
    }

    /// Posts in display order: realtime arrivals first, then server pages.
    pub fn posts(&self) -> impl Iterator<Item = &Post> {
        self.realtime_posts.iter().chain(self.server_posts.iter())
    }

    pub fn len(&self) -> usize {
        self.realtime_posts.len() + self.server_posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, post_id: &str) -> bool {
        self.posts().any(|post| post.id == post_id)
    }

    pub fn reaction_for(&self, post_id: &str) -> Option<ReactionType> {
        self.user_reactions.get(post_id).copied()
    }

    pub fn user_reactions(&self) -> &BTreeMap<String, ReactionType> {
        &self.user_reactions
    }

    pub fn error(&self) -> Option<&EchoError> {
        self.error.as_ref()
    }

    pub fn set_error(&mut self, error: EchoError) {
        self.error = Some(error);
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// Prepend a realtime post unless its ID is already known.
    ///
    /// Returns `true` when the post was added.
    pub fn apply_new_post(&mut self, post: Post) -> bool {
        if self.contains(&post.id) {
            return false;
        }
        self.realtime_posts.insert(0, post);
        self.trim_to_max();
        true
    }

    /// Replace the server-confirmed set with a freshly loaded first page.
    ///
    /// Realtime posts are kept; page entries already shown as realtime posts
    /// are skipped.
    pub fn replace_page(&mut self, posts: Vec<Post>) -> usize {
        self.server_posts.clear();
        self.merge_page(posts)
    }

    /// Append fetched posts whose IDs are not present yet.
    ///
    /// Returns how many posts were added.
    pub fn merge_page(&mut self, posts: Vec<Post>) -> usize {
        let mut added = 0;
        for post in posts {
            if self.contains(&post.id) {
                continue;
            }
            self.server_posts.push(post);
            added += 1;
        }
        self.trim_to_max();
        added
    }

    /// Apply one posts-stream event. Returns `true` when the view changed.
    pub fn apply_post_event(&mut self, event: &PostEvent) -> bool {
        match event {
            PostEvent::NewPost { .. } => match event.to_post() {
                Some(post) => self.apply_new_post(post),
                None => false,
            },
            PostEvent::DisplayCountUpdated {
                post_id,
                display_count,
            } => match self.find_mut(post_id) {
                Some(post) if post.display_count != *display_count => {
                    post.display_count = *display_count;
                    true
                }
                _ => false,
            },
            PostEvent::PostDeleted { post_id } => self.remove(post_id),
        }
    }

    /// Decide what a click on `reaction` does for `post_id`.
    pub fn plan_toggle(&self, post_id: &str, reaction: ReactionType) -> ReactionToggle {
        if self.reaction_for(post_id) == Some(reaction) {
            ReactionToggle::Remove
        } else {
            ReactionToggle::Add(reaction)
        }
    }

    /// Record the confirmed result of a reaction mutation.
    ///
    /// The reaction map only changes after the backend reported success; on
    /// failure the error field is set and the map is left untouched.
    pub fn apply_toggle_outcome(
        &mut self,
        post_id: &str,
        toggle: ReactionToggle,
        outcome: &Result<bool, EchoError>,
    ) {
        match outcome {
            Ok(true) => {
                match toggle {
                    ReactionToggle::Add(reaction) => {
                        self.user_reactions.insert(post_id.to_owned(), reaction);
                    }
                    ReactionToggle::Remove => {
                        self.user_reactions.remove(post_id);
                    }
                }
                self.error = None;
            }
            Ok(false) => self.error = Some(reaction_rejected(post_id)),
            Err(err) => self.error = Some(err.clone()),
        }
    }

    /// Drop everything, for example after logout.
    pub fn reset(&mut self) {
        self.server_posts.clear();
        self.realtime_posts.clear();
        self.user_reactions.clear();
        self.error = None;
    }

    pub fn snapshot(&self) -> TimelineSnapshot {
        TimelineSnapshot {
            posts: self.posts().cloned().collect(),
            user_reactions: self.user_reactions.clone(),
            error_code: self.error.as_ref().map(|err| err.code.clone()),
        }
    }

    /// Clamp a requested page size against the server cap.
    ///
    /// The result is always in `1..=MAX_PAGE_LIMIT`.
    pub fn bounded_page_limit(requested: u16, server_cap: u16) -> u16 {
        let safe_requested = requested.max(1);
        let safe_cap = server_cap.max(1);
        safe_requested.min(safe_cap).min(MAX_PAGE_LIMIT)
    }

    fn find_mut(&mut self, post_id: &str) -> Option<&mut Post> {
        self.realtime_posts
            .iter_mut()
            .chain(self.server_posts.iter_mut())
            .find(|post| post.id == post_id)
    }

    fn remove(&mut self, post_id: &str) -> bool {
        let before = self.len();
        self.realtime_posts.retain(|post| post.id != post_id);
        self.server_posts.retain(|post| post.id != post_id);
        self.user_reactions.remove(post_id);
        before != self.len()
    }

    fn trim_to_max(&mut self) {
        while self.len() > self.max_items {
            if self.server_posts.pop().is_none() {
                self.realtime_posts.pop();
            }
        }
    }
}

fn reaction_rejected(post_id: &str) -> EchoError {
    EchoError::new(
        EchoErrorCategory::GraphQl,
        "reaction_rejected",
        format!("backend rejected reaction change for post '{post_id}'"),
    )
}

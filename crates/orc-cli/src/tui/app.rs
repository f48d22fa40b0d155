//! TUI application state and data model.

use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use orc_db::models::{Task, TaskEvent, TaskStatus};
use orc_db::queries::gate_results::{self, GateResultWithName};
use orc_db::queries::task_events;
use orc_db::queries::tasks as task_db;

/// Which view the TUI is currently showing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum View {
    TaskList,
    TaskDetail(Uuid),
    ReviewQueue,
    Help,
}

/// Application state for the TUI.
pub struct App {
    pub pool: PgPool,
    pub current_view: View,
    pub tasks: Vec<Task>,
    pub selected_task: usize,
    pub gate_results: Vec<GateResultWithName>,
    pub events: Vec<TaskEvent>,
    pub review_tasks: Vec<Task>,
    pub selected_review: usize,
    pub tick_rate: Duration,
    pub should_quit: bool,
    pub status_message: Option<String>,
}

impl App {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            current_view: View::TaskList,
            tasks: Vec::new(),
            selected_task: 0,
            gate_results: Vec::new(),
            events: Vec::new(),
            review_tasks: Vec::new(),
            selected_review: 0,
            tick_rate: Duration::from_secs(1),
            should_quit: false,
            status_message: None,
        }
    }

    /// Refresh data from the database based on the current view.
    pub async fn refresh(&mut self) -> Result<()> {
        match &self.current_view {
            View::TaskList => {
                self.tasks = task_db::list_active_tasks(&self.pool).await?;
                if self.selected_task >= self.tasks.len() && !self.tasks.is_empty() {
                    self.selected_task = self.tasks.len() - 1;
                }
            }
            View::TaskDetail(task_id) => {
                let task_id = *task_id;
                self.gate_results =
                    gate_results::get_latest_gate_results(&self.pool, task_id).await?;
                self.events = task_events::list_events_for_task(&self.pool, task_id).await?;
            }
            View::ReviewQueue => {
                self.review_tasks =
                    task_db::list_tasks_by_status(&self.pool, TaskStatus::Reviewing).await?;
                if self.selected_review >= self.review_tasks.len() && !self.review_tasks.is_empty()
                {
                    self.selected_review = self.review_tasks.len() - 1;
                }
            }
            View::Help => {}
        }
        Ok(())
    }

    // -- Navigation --

    pub fn navigate_back(&mut self) {
        match &self.current_view {
            View::TaskList => self.should_quit = true,
            View::TaskDetail(_) => self.current_view = View::TaskList,
            View::ReviewQueue => self.current_view = View::TaskList,
            View::Help => self.current_view = View::TaskList,
        }
    }

    pub fn navigate_enter(&mut self) {
        match &self.current_view {
            View::TaskList => {
                if let Some(task) = self.tasks.get(self.selected_task) {
                    self.current_view = View::TaskDetail(task.id);
                }
            }
            View::ReviewQueue => {
                if let Some(task) = self.review_tasks.get(self.selected_review) {
                    self.current_view = View::TaskDetail(task.id);
                }
            }
            _ => {}
        }
    }

    pub fn move_up(&mut self) {
        match &self.current_view {
            View::TaskList => {
                if self.selected_task > 0 {
                    self.selected_task -= 1;
                }
            }
            View::ReviewQueue => {
                if self.selected_review > 0 {
                    self.selected_review -= 1;
                }
            }
            _ => {}
        }
    }

    pub fn move_down(&mut self) {
        match &self.current_view {
            View::TaskList => {
                if !self.tasks.is_empty() && self.selected_task < self.tasks.len() - 1 {
                    self.selected_task += 1;
                }
            }
            View::ReviewQueue => {
                if !self.review_tasks.is_empty()
                    && self.selected_review < self.review_tasks.len() - 1
                {
                    self.selected_review += 1;
                }
            }
            _ => {}
        }
    }

    pub fn cycle_view(&mut self) {
        self.current_view = match &self.current_view {
            View::TaskList => View::ReviewQueue,
            View::ReviewQueue => View::TaskList,
            other => other.clone(),
        };
    }

    pub fn show_help(&mut self) {
        self.current_view = View::Help;
    }

    // -- Actions --

    pub async fn approve_selected(&mut self) -> Result<()> {
        let task_id = self.selected_reviewing_task_id();
        if let Some(id) = task_id {
            orc_core::state::dispatch::approve_task(&self.pool, id).await?;
            self.status_message = Some("Task approved".to_string());
            self.refresh().await?;
        }
        Ok(())
    }

    pub async fn reject_selected(&mut self) -> Result<()> {
        let task_id = self.selected_reviewing_task_id();
        if let Some(id) = task_id {
            orc_core::state::dispatch::reject_task(&self.pool, id).await?;
            self.status_message = Some("Task rejected".to_string());
            self.refresh().await?;
        }
        Ok(())
    }

    pub async fn retry_selected(&mut self) -> Result<()> {
        let task_id = self.selected_actionable_task_id();
        if let Some(id) = task_id {
            orc_core::state::dispatch::operator_retry_task(&self.pool, id).await?;
            self.status_message = Some("Task queued for retry".to_string());
            self.refresh().await?;
        }
        Ok(())
    }

    /// Get the task ID of the currently selected task under review, if any.
    fn selected_reviewing_task_id(&self) -> Option<Uuid> {
        match &self.current_view {
            View::ReviewQueue => self.review_tasks.get(self.selected_review).map(|t| t.id),
            View::TaskList => self
                .tasks
                .get(self.selected_task)
                .filter(|t| t.status == TaskStatus::Reviewing)
                .map(|t| t.id),
            _ => None,
        }
    }

    /// Get the task ID of the currently selected task if it's actionable
    /// (failed, or parked waiting on a human) for a manual retry.
    fn selected_actionable_task_id(&self) -> Option<Uuid> {
        match &self.current_view {
            View::TaskList => self
                .tasks
                .get(self.selected_task)
                .filter(|t| {
                    t.status == TaskStatus::Failed || t.status == TaskStatus::WaitingHuman
                })
                .map(|t| t.id),
            View::ReviewQueue => self
                .review_tasks
                .get(self.selected_review)
                .filter(|t| {
                    t.status == TaskStatus::Failed || t.status == TaskStatus::WaitingHuman
                })
                .map(|t| t.id),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

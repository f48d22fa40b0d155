//! TUI rendering using ratatui.

use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table};
use ratatui::Frame;

use orc_db::models::TaskStatus;

use super::app::{App, View};

/// Render the current view.
pub fn render(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(3),    // main content
            Constraint::Length(1), // status bar
        ])
        .split(f.area());

    match &app.current_view {
        View::TaskList => render_task_list(f, app, chunks[0]),
        View::TaskDetail(task_id) => render_task_detail(f, app, *task_id, chunks[0]),
        View::ReviewQueue => render_review_queue(f, app, chunks[0]),
        View::Help => render_help(f, chunks[0]),
    }

    render_status_bar(f, app, chunks[1]);
}

fn render_task_list(f: &mut Frame, app: &App, area: Rect) {
    let header_cells = ["Repo", "Issue", "Status", "Attempt", "PR", "Created"]
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow)));
    let header = Row::new(header_cells).height(1);

    let rows = app.tasks.iter().enumerate().map(|(i, task)| {
        let style = if i == app.selected_task {
            Style::default()
                .bg(Color::DarkGray)
                .add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        };

        let pr = task
            .pr_number
            .map(|n| format!("#{n}"))
            .unwrap_or_else(|| "-".to_string());
        let created = task.created_at.format("%Y-%m-%d %H:%M").to_string();

        Row::new(vec![
            Cell::from(task.repo.clone()),
            Cell::from(format!("#{}", task.issue_number)),
            Cell::from(task_status_colored(&task.status)),
            Cell::from(format!("{}/{}", task.attempt_count, task.max_attempts)),
            Cell::from(pr),
            Cell::from(created),
        ])
        .style(style)
    });

    let table = Table::new(
        rows,
        [
            Constraint::Percentage(30),
            Constraint::Length(8),
            Constraint::Length(18),
            Constraint::Length(10),
            Constraint::Length(8),
            Constraint::Length(18),
        ],
    )
    .header(header)
    .block(Block::default().borders(Borders::ALL).title(" Tasks "));

    f.render_widget(table, area);
}

fn render_task_detail(f: &mut Frame, app: &App, task_id: uuid::Uuid, area: Rect) {
    let task = app
        .tasks
        .iter()
        .find(|t| t.id == task_id)
        .or_else(|| app.review_tasks.iter().find(|t| t.id == task_id));

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(5), // task info
            Constraint::Min(5),    // gate results
            Constraint::Min(5),    // events
        ])
        .split(area);

    let info_text = if let Some(t) = task {
        vec![
            Line::from(vec![
                Span::styled("Task: ", Style::default().fg(Color::Yellow)),
                Span::raw(format!("{} #{}", t.repo, t.issue_number)),
            ]),
            Line::from(vec![
                Span::styled("Status: ", Style::default().fg(Color::Yellow)),
                Span::raw(t.status.to_string()),
                Span::raw(format!(
                    "  Attempt: {}/{}",
                    t.attempt_count, t.max_attempts
                )),
                Span::raw(format!(
                    "  PR: {}",
                    t.pr_number
                        .map(|n| format!("#{n}"))
                        .unwrap_or_else(|| "-".to_string())
                )),
            ]),
        ]
    } else {
        vec![Line::from("Task not found")]
    };

    let info = Paragraph::new(info_text).block(
        Block::default()
            .borders(Borders::ALL)
            .title(" Task Detail "),
    );
    f.render_widget(info, chunks[0]);

    // Gate results.
    let gate_header_cells = ["Invariant", "Passed", "Exit", "Duration"]
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow)));
    let gate_header = Row::new(gate_header_cells).height(1);

    let gate_rows = app.gate_results.iter().map(|gr| {
        let pass_style = if gr.passed {
            Style::default().fg(Color::Green)
        } else {
            Style::default().fg(Color::Red)
        };

        Row::new(vec![
            Cell::from(gr.invariant_name.clone()),
            Cell::from(if gr.passed { "PASS" } else { "FAIL" }).style(pass_style),
            Cell::from(
                gr.exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::from(
                gr.duration_ms
                    .map(|d| format!("{d}ms"))
                    .unwrap_or_else(|| "-".to_string()),
            ),
        ])
    });

    let gate_table = Table::new(
        gate_rows,
        [
            Constraint::Percentage(40),
            Constraint::Length(8),
            Constraint::Length(8),
            Constraint::Length(10),
        ],
    )
    .header(gate_header)
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title(" Gate Results "),
    );
    f.render_widget(gate_table, chunks[1]);

    // Recent events.
    let event_lines: Vec<Line> = app
        .events
        .iter()
        .rev()
        .take(10)
        .map(|ev| {
            let time = ev.recorded_at.format("%H:%M:%S").to_string();
            Line::from(vec![
                Span::styled(format!("[{time}] "), Style::default().fg(Color::DarkGray)),
                Span::styled(
                    format!("{} ", ev.event_type),
                    Style::default().fg(Color::Cyan),
                ),
                Span::raw(truncate(
                    ev.output_summary.as_deref().unwrap_or(""),
                    80,
                )),
            ])
        })
        .collect();

    let events = Paragraph::new(event_lines).block(
        Block::default()
            .borders(Borders::ALL)
            .title(" Recent Events "),
    );
    f.render_widget(events, chunks[2]);
}

fn render_review_queue(f: &mut Frame, app: &App, area: Rect) {
    let header_cells = ["Repo", "Issue", "Status", "Attempt"]
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().fg(Color::Yellow)));
    let header = Row::new(header_cells).height(1);

    let rows = app.review_tasks.iter().enumerate().map(|(i, t)| {
        let style = if i == app.selected_review {
            Style::default()
                .bg(Color::DarkGray)
                .add_modifier(Modifier::BOLD)
        } else {
            Style::default()
        };

        Row::new(vec![
            Cell::from(t.repo.clone()),
            Cell::from(format!("#{}", t.issue_number)),
            Cell::from(t.status.to_string()),
            Cell::from(format!("{}/{}", t.attempt_count, t.max_attempts)),
        ])
        .style(style)
    });

    let table = Table::new(
        rows,
        [
            Constraint::Percentage(40),
            Constraint::Length(8),
            Constraint::Length(14),
            Constraint::Length(10),
        ],
    )
    .header(header)
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" Review Queue ({}) ", app.review_tasks.len())),
    );

    f.render_widget(table, area);
}

fn render_help(f: &mut Frame, area: Rect) {
    let text = vec![
        Line::from(""),
        Line::from(vec![Span::styled(
            "  Navigation",
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        )]),
        Line::from("    j/Down    Move down"),
        Line::from("    k/Up      Move up"),
        Line::from("    Enter     Drill into selected"),
        Line::from("    Esc/q     Back / Quit"),
        Line::from("    Tab       Toggle Tasks / Review Queue"),
        Line::from(""),
        Line::from(vec![Span::styled(
            "  Actions",
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        )]),
        Line::from("    a         Approve selected task (if reviewing)"),
        Line::from("    r         Reject selected task (if reviewing)"),
        Line::from("    R         Retry selected task (if failed/waiting on human)"),
        Line::from(""),
        Line::from(vec![Span::styled(
            "  Other",
            Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
        )]),
        Line::from("    ?         Show this help"),
        Line::from(""),
    ];

    let help = Paragraph::new(text).block(Block::default().borders(Borders::ALL).title(" Help "));
    f.render_widget(help, area);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let view_name = match &app.current_view {
        View::TaskList => "Tasks",
        View::TaskDetail(_) => "Task Detail",
        View::ReviewQueue => "Review Queue",
        View::Help => "Help",
    };

    let review_count = app
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Reviewing)
        .count();

    let status_msg = app.status_message.as_deref().unwrap_or("");

    let bar = Line::from(vec![
        Span::styled(
            format!(" {view_name} "),
            Style::default().bg(Color::Blue).fg(Color::White),
        ),
        Span::raw("  "),
        if review_count > 0 {
            Span::styled(
                format!("{review_count} awaiting review"),
                Style::default().fg(Color::Yellow),
            )
        } else {
            Span::styled(
                "no tasks awaiting review",
                Style::default().fg(Color::DarkGray),
            )
        },
        Span::raw("  "),
        Span::styled(status_msg, Style::default().fg(Color::Green)),
        Span::raw("  q:quit  ?:help  Tab:switch view"),
    ]);

    f.render_widget(Paragraph::new(bar), area);
}

// -- Helpers --

fn task_status_colored(status: &TaskStatus) -> Span<'static> {
    use TaskStatus::*;
    let color = match status {
        New | Planning | BreakingDown | Coding | Testing | VisualTesting | Fixing
        | Reflecting | Replanning | Orchestrating => Color::Blue,
        PlanningDone | BreakdownDone | CodingDone | TestsPassed | VisualTestsPassed
        | ReviewApproved | WaitingBatch | PrCreated => Color::Cyan,
        PlanPendingApproval | Reviewing | WaitingHuman => Color::Yellow,
        TestsFailed | VisualTestsFailed | ReviewRejected => Color::Magenta,
        Completed => Color::Green,
        Failed => Color::Red,
    };
    Span::styled(status.to_string(), Style::default().fg(color))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max])
    }
}

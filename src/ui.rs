// 🖥️ Hierarchy Browser - terminal view over a published snapshot
//
// Three pages: the expandable entity tree, a flat entity table with status
// filter and search, and the high-contamination list.

use crate::exporter::GraphSnapshot;
use crate::graph::{EntityGraph, EntityNode, Ratio, Status, VisibleNode};
use crate::summary::{high_contamination, HIGH_CONTAMINATION_LIMIT};
use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table, TableState},
    Frame, Terminal,
};
use std::collections::HashSet;
use std::io;

const PAGE_STEP: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    Hierarchy,
    Entities,
    Flagged,
}

impl Page {
    pub fn next(&self) -> Self {
        match self {
            Page::Hierarchy => Page::Entities,
            Page::Entities => Page::Flagged,
            Page::Flagged => Page::Hierarchy,
        }
    }

    pub fn previous(&self) -> Self {
        match self {
            Page::Hierarchy => Page::Flagged,
            Page::Entities => Page::Hierarchy,
            Page::Flagged => Page::Entities,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Page::Hierarchy => "Hierarchy",
            Page::Entities => "Entities",
            Page::Flagged => "High Contamination",
        }
    }
}

pub struct App {
    pub graph: EntityGraph,
    pub root_id: String,
    pub expanded: HashSet<String>,
    /// Tree rows for the current expanded set
    pub tree_rows: Vec<VisibleNode>,
    /// Entity ids for the Entities page after filter and search
    pub entity_rows: Vec<String>,
    pub flagged_rows: Vec<String>,
    pub state: TableState,
    pub current_page: Page,
    pub show_detail: bool,
    pub status_filter: Option<Status>,
    pub search_query: String,
    pub search_mode: bool,
}

impl App {
    pub fn new(snapshot: &GraphSnapshot) -> Self {
        let graph = EntityGraph::from_snapshot(snapshot);
        let root_id = snapshot.root_id().unwrap_or_default().to_string();
        let flagged_rows = high_contamination(snapshot, HIGH_CONTAMINATION_LIMIT)
            .into_iter()
            .map(|n| n.pan.clone())
            .collect();

        let mut app = App {
            graph,
            expanded: HashSet::from([root_id.clone()]),
            root_id,
            tree_rows: Vec::new(),
            entity_rows: Vec::new(),
            flagged_rows,
            state: TableState::default(),
            current_page: Page::Hierarchy,
            show_detail: false,
            status_filter: None,
            search_query: String::new(),
            search_mode: false,
        };
        app.refresh_tree();
        app.refresh_entities();
        app.state.select(if app.row_count() > 0 { Some(0) } else { None });
        app
    }

    pub fn refresh_tree(&mut self) {
        self.tree_rows = self
            .graph
            .visible_nodes(&self.root_id, &self.expanded)
            .collect();
    }

    pub fn refresh_entities(&mut self) {
        let base: Vec<&EntityNode> = if self.search_query.trim().is_empty() {
            self.graph.nodes().collect()
        } else {
            self.graph.search(&self.search_query)
        };
        self.entity_rows = base
            .into_iter()
            .filter(|n| self.status_filter.map_or(true, |s| n.status == s))
            .map(|n| n.id.clone())
            .collect();
    }

    pub fn row_count(&self) -> usize {
        match self.current_page {
            Page::Hierarchy => self.tree_rows.len(),
            Page::Entities => self.entity_rows.len(),
            Page::Flagged => self.flagged_rows.len(),
        }
    }

    pub fn selected_id(&self) -> Option<&str> {
        let i = self.state.selected()?;
        match self.current_page {
            Page::Hierarchy => self.tree_rows.get(i).map(|r| r.id.as_str()),
            Page::Entities => self.entity_rows.get(i).map(String::as_str),
            Page::Flagged => self.flagged_rows.get(i).map(String::as_str),
        }
    }

    pub fn selected_node(&self) -> Option<&EntityNode> {
        self.selected_id().and_then(|id| self.graph.get(id))
    }

    /// Expand or collapse the selected tree node
    pub fn toggle_expand(&mut self) {
        if self.current_page != Page::Hierarchy {
            return;
        }
        let Some(id) = self.selected_id().map(str::to_string) else {
            return;
        };
        if !self.expanded.remove(&id) {
            self.expanded.insert(id);
        }
        self.refresh_tree();
    }

    pub fn expand_all(&mut self) {
        self.expanded = self.graph.nodes().map(|n| n.id.clone()).collect();
        self.refresh_tree();
    }

    pub fn collapse_all(&mut self) {
        self.expanded = HashSet::from([self.root_id.clone()]);
        self.refresh_tree();
        self.clamp_selection();
    }

    pub fn cycle_status_filter(&mut self) {
        self.status_filter = match self.status_filter {
            None => Some(Status::Bogus),
            Some(Status::Bogus) => Some(Status::Contaminated),
            Some(Status::Contaminated) => Some(Status::Missing),
            Some(Status::Missing) => Some(Status::Ok),
            Some(Status::Ok) => None,
        };
        self.refresh_entities();
        self.clamp_selection();
    }

    pub fn set_search(&mut self, query: &str) {
        self.search_query = query.to_string();
        self.refresh_entities();
        self.clamp_selection();
    }

    pub fn toggle_detail(&mut self) {
        self.show_detail = !self.show_detail;
    }

    pub fn next_page(&mut self) {
        self.current_page = self.current_page.next();
        self.clamp_selection();
    }

    pub fn previous_page(&mut self) {
        self.current_page = self.current_page.previous();
        self.clamp_selection();
    }

    fn clamp_selection(&mut self) {
        let len = self.row_count();
        let selected = match self.state.selected() {
            _ if len == 0 => None,
            Some(i) => Some(i.min(len - 1)),
            None => Some(0),
        };
        self.state.select(selected);
    }

    pub fn next(&mut self) {
        let len = self.row_count();
        if len == 0 {
            return;
        }
        let i = match self.state.selected() {
            Some(i) if i + 1 < len => i + 1,
            Some(_) => 0,
            None => 0,
        };
        self.state.select(Some(i));
    }

    pub fn previous(&mut self) {
        let len = self.row_count();
        if len == 0 {
            return;
        }
        let i = match self.state.selected() {
            Some(0) | None => len - 1,
            Some(i) => i - 1,
        };
        self.state.select(Some(i));
    }

    pub fn page_down(&mut self) {
        let len = self.row_count();
        if len == 0 {
            return;
        }
        let i = self.state.selected().unwrap_or(0);
        self.state.select(Some((i + PAGE_STEP).min(len - 1)));
    }

    pub fn page_up(&mut self) {
        let i = self.state.selected().unwrap_or(0);
        self.state.select(Some(i.saturating_sub(PAGE_STEP)));
    }
}

pub fn run_ui(app: &mut App) -> Result<()> {
    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let res = run_app(&mut terminal, app);

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("Error: {:?}", err);
    }

    Ok(())
}

fn run_app<B: ratatui::backend::Backend>(terminal: &mut Terminal<B>, app: &mut App) -> io::Result<()> {
    loop {
        terminal.draw(|f| ui(f, app))?;

        let Event::Key(key) = event::read()? else {
            continue;
        };

        if app.search_mode {
            match key.code {
                KeyCode::Enter | KeyCode::Esc => app.search_mode = false,
                KeyCode::Backspace => {
                    let mut query = app.search_query.clone();
                    query.pop();
                    app.set_search(&query);
                }
                KeyCode::Char(c) => {
                    let query = format!("{}{}", app.search_query, c);
                    app.set_search(&query);
                }
                _ => {}
            }
            continue;
        }

        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
            KeyCode::Enter => app.toggle_detail(),
            KeyCode::Char(' ') | KeyCode::Right | KeyCode::Left => app.toggle_expand(),
            KeyCode::Tab => {
                if key.modifiers.contains(KeyModifiers::SHIFT) {
                    app.previous_page();
                } else {
                    app.next_page();
                }
            }
            KeyCode::BackTab => app.previous_page(),
            KeyCode::Char('e') => app.expand_all(),
            KeyCode::Char('c') => app.collapse_all(),
            KeyCode::Char('f') => {
                app.current_page = Page::Entities;
                app.cycle_status_filter();
            }
            KeyCode::Char('/') => {
                app.current_page = Page::Entities;
                app.search_mode = true;
                app.clamp_selection();
            }
            KeyCode::Down | KeyCode::Char('j') => app.next(),
            KeyCode::Up | KeyCode::Char('k') => app.previous(),
            KeyCode::PageDown => app.page_down(),
            KeyCode::PageUp => app.page_up(),
            KeyCode::Home => app.state.select(Some(0)),
            KeyCode::End => {
                let len = app.row_count();
                if len > 0 {
                    app.state.select(Some(len - 1));
                }
            }
            _ => {}
        }
    }
}

fn ui(f: &mut Frame, app: &mut App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header with navigation
            Constraint::Min(0),    // Content area
            Constraint::Length(3), // Status bar
        ])
        .split(f.size());

    render_header(f, chunks[0], app);

    if app.show_detail {
        let content_chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
            .split(chunks[1]);

        render_page(f, content_chunks[0], app);
        render_detail_panel(f, content_chunks[1], app);
    } else {
        render_page(f, chunks[1], app);
    }

    render_status_bar(f, chunks[2], app);
}

fn render_page(f: &mut Frame, area: Rect, app: &mut App) {
    match app.current_page {
        Page::Hierarchy => render_tree(f, area, app),
        Page::Entities => render_entities(f, area, app),
        Page::Flagged => render_flagged(f, area, app),
    }
}

fn status_color(status: Status) -> Color {
    match status {
        Status::Missing => Color::DarkGray,
        Status::Bogus => Color::Red,
        Status::Contaminated => Color::Yellow,
        Status::Ok => Color::Green,
    }
}

fn ratio_text(ratio: &Ratio) -> String {
    match ratio {
        Ratio::Infinite => "∞".to_string(),
        Ratio::Finite(r) => r.round_dp(2).to_string(),
    }
}

fn render_header(f: &mut Frame, area: Rect, app: &App) {
    let pages = [Page::Hierarchy, Page::Entities, Page::Flagged];

    let mut tab_spans = vec![];
    for (i, page) in pages.iter().enumerate() {
        if i > 0 {
            tab_spans.push(Span::raw(" │ "));
        }
        let style = if *page == app.current_page {
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD | Modifier::UNDERLINED)
        } else {
            Style::default().fg(Color::DarkGray)
        };
        tab_spans.push(Span::styled(page.title().to_string(), style));
    }

    let count = |s: Status| app.graph.filter_by_status(s).len();
    tab_spans.push(Span::raw("  |  "));
    tab_spans.push(Span::styled(
        format!("Entities: {}", app.graph.len()),
        Style::default().fg(Color::White),
    ));
    for status in [Status::Bogus, Status::Contaminated, Status::Missing] {
        tab_spans.push(Span::raw("  "));
        tab_spans.push(Span::styled(
            format!("{} {}", status.as_str(), count(status)),
            Style::default().fg(status_color(status)),
        ));
    }

    let header = Paragraph::new(vec![Line::from(tab_spans)])
        .block(Block::default().borders(Borders::ALL).border_style(Style::default().fg(Color::Cyan)));

    f.render_widget(header, area);
}

fn header_row(titles: &[&'static str]) -> Row<'static> {
    let cells = titles.iter().map(|h| {
        Cell::from(*h).style(Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD))
    });
    Row::new(cells).style(Style::default().bg(Color::DarkGray)).height(1)
}

fn node_cells(node: &EntityNode, label: String) -> Vec<Cell<'static>> {
    let color = status_color(node.status);
    vec![
        Cell::from(label),
        Cell::from(truncate(&node.entity_name, 28)),
        Cell::from(ratio_text(&node.purchase_to_sales_ratio)),
        Cell::from(format!("{}%", node.contamination_level.round_dp(1))),
        Cell::from(format!("{:.1}", node.risk_score)),
        Cell::from(node.status.as_str()).style(Style::default().fg(color)),
    ]
}

const NODE_WIDTHS: [Constraint; 6] = [
    Constraint::Min(24),
    Constraint::Length(30),
    Constraint::Length(10),
    Constraint::Length(10),
    Constraint::Length(7),
    Constraint::Length(14),
];

fn node_table<'a>(rows: Vec<Row<'a>>, title: String) -> Table<'a> {
    Table::new(rows, NODE_WIDTHS)
        .header(header_row(&["PAN", "Name", "P/S", "Contam.", "Risk", "Status"]))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::White))
                .title(title),
        )
        .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD))
        .highlight_symbol("→ ")
}

fn render_tree(f: &mut Frame, area: Rect, app: &mut App) {
    let rows: Vec<Row> = app
        .tree_rows
        .iter()
        .filter_map(|row| {
            let node = app.graph.get(&row.id)?;
            let marker = match (row.has_children, row.expanded) {
                (false, _) => "  ",
                (true, true) => "▾ ",
                (true, false) => "▸ ",
            };
            let label = format!("{}{}{}", "  ".repeat(row.depth), marker, row.id);
            Some(Row::new(node_cells(node, label)).height(1))
        })
        .collect();

    let table = node_table(rows, format!(" Hierarchy from {} ", app.root_id));
    f.render_stateful_widget(table, area, &mut app.state);
}

fn render_entities(f: &mut Frame, area: Rect, app: &mut App) {
    let rows: Vec<Row> = app
        .entity_rows
        .iter()
        .filter_map(|id| app.graph.get(id))
        .map(|node| Row::new(node_cells(node, node.id.clone())).height(1))
        .collect();

    let mut title = format!(" Entities ({}) ", app.entity_rows.len());
    if let Some(status) = app.status_filter {
        title.push_str(&format!("[{}] ", status.as_str()));
    }
    if !app.search_query.is_empty() {
        title.push_str(&format!("search: {} ", app.search_query));
    }

    f.render_stateful_widget(node_table(rows, title), area, &mut app.state);
}

fn render_flagged(f: &mut Frame, area: Rect, app: &mut App) {
    let rows: Vec<Row> = app
        .flagged_rows
        .iter()
        .filter_map(|id| app.graph.get(id))
        .map(|node| Row::new(node_cells(node, node.id.clone())).height(1))
        .collect();

    let table = node_table(rows, " Contamination above 50% ".to_string());
    f.render_stateful_widget(table, area, &mut app.state);
}

fn render_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let selected = app.state.selected().map(|i| i + 1).unwrap_or(0);

    let mut status_spans = vec![Span::styled(
        format!(" Row: {}/{} ", selected, app.row_count()),
        Style::default().fg(Color::Cyan),
    )];

    if app.search_mode {
        status_spans.push(Span::raw(" | "));
        status_spans.push(Span::styled(
            format!("Search: {}_", app.search_query),
            Style::default().fg(Color::Green),
        ));
        status_spans.push(Span::raw(" (Enter done)"));
    } else {
        for (key, label) in [
            ("Space", " Expand | "),
            ("e/c", " All | "),
            ("/", " Search | "),
            ("f", " Filter | "),
            ("Enter", " Details | "),
            ("Tab", " Page | "),
        ] {
            status_spans.push(Span::styled(key, Style::default().fg(Color::Yellow)));
            status_spans.push(Span::raw(label));
        }
        status_spans.push(Span::styled("q", Style::default().fg(Color::Red)));
        status_spans.push(Span::raw(" Quit"));
    }

    let status_bar = Paragraph::new(vec![Line::from(status_spans)]).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::White)),
    );

    f.render_widget(status_bar, area);
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

fn render_detail_panel(f: &mut Frame, area: Rect, app: &App) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow))
        .title(" Entity Details ");

    let Some(node) = app.selected_node() else {
        f.render_widget(Paragraph::new("No entity selected").block(block), area);
        return;
    };

    let label = |text: &'static str| {
        Span::styled(text, Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
    };
    let field = |name: &'static str, value: String| Line::from(vec![label(name), Span::raw(value)]);

    let mut content = vec![
        Line::from(""),
        field("  PAN: ", node.id.clone()),
        field("  Name: ", node.entity_name.clone()),
        Line::from(vec![
            label("  Status: "),
            Span::styled(node.status.as_str(), Style::default().fg(status_color(node.status))),
        ]),
        Line::from(""),
        field("  Total Sales: ", node.total_sales.round_dp(2).to_string()),
        field("  Total Purchases: ", node.total_purchases.round_dp(2).to_string()),
        field("  P/S Ratio: ", ratio_text(&node.purchase_to_sales_ratio)),
        field("  Transactions: ", node.transaction_count.to_string()),
        Line::from(""),
        field("  Contamination: ", format!("{}%", node.contamination_level.round_dp(2))),
        field("  Bogus Value: ", node.bogus_value.round_dp(2).to_string()),
        field("  Risk Score: ", format!("{:.2}", node.risk_score)),
        Line::from(""),
        field("  Parents: ", node.parent_ids.len().to_string()),
        field("  Children: ", node.children_ids.len().to_string()),
        Line::from(""),
        Line::from("  ─────────────────────────────────────"),
        Line::from(vec![Span::styled(
            "  SALES",
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD | Modifier::UNDERLINED),
        )]),
    ];

    for sale in node.sales_records.iter().take(10) {
        content.push(Line::from(format!(
            "  {} {} {}",
            sale.buyer_pan,
            truncate(&sale.buyer_name, 18),
            sale.amount.round_dp(2)
        )));
    }
    if node.sales_records.len() > 10 {
        content.push(Line::from(format!("  … {} more", node.sales_records.len() - 10)));
    }

    f.render_widget(Paragraph::new(content).block(block), area);
}

//! Operator interaction: board choice, manual board entry and the final
//! confirmation. Prompt helpers take their streams as parameters so tests can
//! drive them without a terminal.

use std::io::{self, BufRead, Stdout, Write};
use std::time::Duration;

use crossterm::cursor::{Hide, Show};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Style};
use ratatui::widgets::{Block, BorderType, Borders, List, ListItem, ListState, Paragraph};

use crate::error::{Error, ErrorKind, Result};
use crate::registry::{BoardRecord, CUSTOM_BOARD_ID};

pub fn board_table(boards: &[&BoardRecord]) -> String {
    let mut out = format!("{:>4}  {:<36} {:<10} {}\n", "ID", "MODEL", "SOC", "DTB");
    for b in boards {
        out.push_str(&format!(
            "{:>4}  {:<36} {:<10} {}\n",
            b.id, b.model, b.soc, b.device_tree_file
        ));
    }
    out.push_str(&format!("{:>4}  {}\n", CUSTOM_BOARD_ID, "Other (enter details manually)"));
    out
}

fn read_line<R: BufRead>(input: &mut R) -> Result<String> {
    let mut line = String::new();
    let n = input
        .read_line(&mut line)
        .map_err(|e| Error::new(ErrorKind::Precondition, format!("failed to read input: {e}")))?;
    if n == 0 {
        return Err(Error::new(ErrorKind::Precondition, "input closed"));
    }
    Ok(line.trim().to_string())
}

fn prompt<R: BufRead, W: Write>(input: &mut R, output: &mut W, text: &str) -> Result<String> {
    write!(output, "{text}").ok();
    output.flush().ok();
    read_line(input)
}

/// Blank input picks `default` (the running board) when it is on offer.
pub fn parse_board_choice(raw: &str, default: Option<u32>) -> Result<u32> {
    let raw = raw.trim();
    if raw.is_empty() {
        return default.ok_or_else(|| Error::new(ErrorKind::RegistryLookup, "no board selected"));
    }
    raw.parse::<u32>()
        .map_err(|_| Error::new(ErrorKind::RegistryLookup, format!("invalid board id '{raw}'")))
}

pub fn prompt_board_id<R: BufRead, W: Write>(
    boards: &[&BoardRecord],
    default: Option<u32>,
    input: &mut R,
    output: &mut W,
) -> Result<u32> {
    let default = default.filter(|d| boards.iter().any(|b| b.id == *d));
    write!(output, "{}", board_table(boards)).ok();
    let text = match default {
        Some(d) => format!("Board ID [{d}]: "),
        None => "Board ID: ".to_string(),
    };
    let raw = prompt(input, output, &text)?;
    parse_board_choice(&raw, default)
}

/// Board fields supplied on the command line for id 0.
#[derive(Debug, Clone, Default)]
pub struct ManualFields {
    pub soc: Option<String>,
    pub device_tree_file: Option<String>,
    pub uboot_overload_file: Option<String>,
    pub mainline_uboot_file: Option<String>,
    pub bootloader_img_file: Option<String>,
}

pub fn manual_entry<R: BufRead, W: Write>(
    fields: ManualFields,
    input: &mut R,
    output: &mut W,
) -> Result<BoardRecord> {
    let mut ask = |given: Option<String>, label: &str, required: bool| -> Result<Option<String>> {
        if let Some(v) = given.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
            return Ok(Some(v));
        }
        let hint = if required { "" } else { " (blank for none)" };
        let v = prompt(input, output, &format!("{label}{hint}: "))?;
        if v.is_empty() && required {
            return Err(Error::new(
                ErrorKind::Precondition,
                format!("{label} is required for a manual board"),
            ));
        }
        Ok((!v.is_empty()).then_some(v))
    };
    let soc = ask(fields.soc, "SoC", true)?.unwrap_or_default();
    let device_tree_file = ask(fields.device_tree_file, "Device tree file", true)?.unwrap_or_default();
    let uboot_overload_file = ask(fields.uboot_overload_file, "u-boot overload file", false)?;
    let mainline_uboot_file = ask(fields.mainline_uboot_file, "Mainline u-boot file", false)?;
    let bootloader_img_file = ask(fields.bootloader_img_file, "Bootloader image", false)?;

    Ok(BoardRecord {
        id: CUSTOM_BOARD_ID,
        model: format!("Custom {soc}"),
        soc,
        device_tree_file,
        uboot_overload_file,
        mainline_uboot_file,
        bootloader_img_file,
        ..Default::default()
    })
}

pub fn confirm<R: BufRead, W: Write>(summary: &str, input: &mut R, output: &mut W) -> Result<bool> {
    writeln!(output, "{summary}").ok();
    let answer = prompt(input, output, "All data on the target will be destroyed. Continue? [y/N]: ")?;
    Ok(matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes"))
}

struct Picker {
    items: Vec<(u32, String)>,
    list: ListState,
}

impl Picker {
    fn new(boards: &[&BoardRecord], default: Option<u32>) -> Self {
        let mut items: Vec<(u32, String)> = boards
            .iter()
            .map(|b| (b.id, format!("{:>4}  {:<36} {:<10} {}", b.id, b.model, b.soc, b.device_tree_file)))
            .collect();
        items.push((CUSTOM_BOARD_ID, format!("{:>4}  Other (enter details manually)", CUSTOM_BOARD_ID)));
        let selected = default
            .and_then(|d| items.iter().position(|(id, _)| *id == d))
            .unwrap_or(0);
        let mut list = ListState::default();
        list.select(Some(selected));
        Self { items, list }
    }

    fn select_next(&mut self) {
        let i = self.list.selected().unwrap_or(0);
        self.list.select(Some((i + 1).min(self.items.len().saturating_sub(1))));
    }

    fn select_prev(&mut self) {
        let i = self.list.selected().unwrap_or(0);
        self.list.select(Some(i.saturating_sub(1)));
    }

    fn selected_id(&self) -> Option<u32> {
        self.list
            .selected()
            .and_then(|i| self.items.get(i))
            .map(|(id, _)| *id)
    }

    fn draw(&self, f: &mut ratatui::Frame) {
        let rows = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(3), Constraint::Length(1)])
            .split(f.area());
        let items: Vec<ListItem> = self
            .items
            .iter()
            .map(|(_, line)| ListItem::new(line.clone()))
            .collect();
        let list = List::new(items)
            .block(
                Block::default()
                    .title("Select board")
                    .borders(Borders::ALL)
                    .border_type(BorderType::Rounded),
            )
            .highlight_style(Style::default().fg(Color::Black).bg(Color::LightYellow))
            .highlight_symbol("> ");
        let mut state = self.list.clone();
        f.render_stateful_widget(list, rows[0], &mut state);
        f.render_widget(
            Paragraph::new("Up/Down: move  Enter: select  q/Esc: abort"),
            rows[1],
        );
    }
}

fn run_picker(terminal: &mut Terminal<CrosstermBackend<Stdout>>, mut picker: Picker) -> Result<u32> {
    let tick = Duration::from_millis(100);
    loop {
        terminal
            .draw(|f| picker.draw(f))
            .map_err(|e| Error::msg(format!("tui draw failed: {e}")))?;
        if !event::poll(tick).map_err(|e| Error::msg(e.to_string()))? {
            continue;
        }
        let Event::Key(key) = event::read().map_err(|e| Error::msg(e.to_string()))? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        let ctrl_c = key.modifiers.contains(KeyModifiers::CONTROL)
            && matches!(key.code, KeyCode::Char('c'));
        match key.code {
            _ if ctrl_c => return Err(Error::new(ErrorKind::Precondition, "board selection aborted")),
            KeyCode::Char('q') | KeyCode::Esc => {
                return Err(Error::new(ErrorKind::Precondition, "board selection aborted"));
            }
            KeyCode::Down | KeyCode::Char('j') => picker.select_next(),
            KeyCode::Up | KeyCode::Char('k') => picker.select_prev(),
            KeyCode::Enter => {
                if let Some(id) = picker.selected_id() {
                    return Ok(id);
                }
            }
            _ => {}
        }
    }
}

pub fn pick_board_tui(boards: &[&BoardRecord], default: Option<u32>) -> Result<u32> {
    let mut stdout = io::stdout();
    enable_raw_mode().map_err(|e| Error::msg(e.to_string()))?;
    execute!(stdout, EnterAlternateScreen, Hide).map_err(|e| Error::msg(e.to_string()))?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).map_err(|e| Error::msg(e.to_string()))?;
    terminal
        .clear()
        .map_err(|e| Error::msg(format!("tui clear failed: {e}")))?;

    let result = run_picker(&mut terminal, Picker::new(boards, default));

    disable_raw_mode().ok();
    execute!(terminal.backend_mut(), LeaveAlternateScreen, Show).ok();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn board(id: u32) -> BoardRecord {
        BoardRecord {
            id,
            model: format!("Box {id}"),
            soc: "s905x".into(),
            device_tree_file: "x.dtb".into(),
            ..Default::default()
        }
    }

    #[test]
    fn blank_input_reuses_running_board() {
        let (a, b) = (board(101), board(102));
        let boards = vec![&a, &b];
        let mut out = Vec::new();
        let id = prompt_board_id(&boards, Some(102), &mut Cursor::new("\n"), &mut out).expect("id");
        assert_eq!(id, 102);
        let shown = String::from_utf8(out).expect("utf8");
        assert!(shown.contains("Box 101"));
        assert!(shown.contains("Board ID [102]"));

        // A default outside the filtered list is not offered.
        let err = prompt_board_id(&boards, Some(7), &mut Cursor::new("\n"), &mut Vec::new())
            .expect_err("no default");
        assert_eq!(err.kind(), ErrorKind::RegistryLookup);
    }

    #[test]
    fn manual_entry_prompts_only_for_missing_fields() {
        let fields = ManualFields {
            soc: Some("s905x3".into()),
            ..Default::default()
        };
        let mut out = Vec::new();
        let rec = manual_entry(
            fields,
            &mut Cursor::new("meson-sm1-x96-max-plus.dtb\nu-boot-x96maxplus.bin\n\n\n"),
            &mut out,
        )
        .expect("manual");
        assert_eq!(rec.id, 0);
        assert_eq!(rec.soc, "s905x3");
        assert_eq!(rec.device_tree_file, "meson-sm1-x96-max-plus.dtb");
        assert_eq!(rec.uboot_overload_file.as_deref(), Some("u-boot-x96maxplus.bin"));
        assert_eq!(rec.mainline_uboot_file, None);
        assert!(!String::from_utf8(out).expect("utf8").contains("SoC"));
    }

    #[test]
    fn manual_entry_requires_device_tree() {
        let fields = ManualFields {
            soc: Some("s905x".into()),
            ..Default::default()
        };
        let err = manual_entry(fields, &mut Cursor::new("\n"), &mut Vec::new()).expect_err("dtb");
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[test]
    fn confirmation_defaults_to_no() {
        assert!(!confirm("plan", &mut Cursor::new("\n"), &mut Vec::new()).expect("answer"));
        assert!(confirm("plan", &mut Cursor::new("yes\n"), &mut Vec::new()).expect("answer"));
    }
}

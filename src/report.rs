//! Human-readable reports over decoded records
//!
//! Every function here only formats; related records are decoded through
//! the [`Session`] on demand.

use crate::arch::aarch64::{exception_class, SavedRegisterState};
use crate::ipc::{IpcEntry, IpcPort, IpcSpace, Voucher};
use crate::kern::{NextPc, Task, Thread, Zone};
use crate::memory::MemoryReader;
use crate::session::Session;
use crate::symbols::SymbolTable;
use crate::types::{Field, KAddr};

/// Rendering of a NULL pointer
pub const NULL_STR: &str = "NULL";
/// Rendering of a missing value in tables
pub const NA_STR: &str = "N/A";

/// Accumulated report text
#[derive(Debug, Default)]
pub struct Report {
    text: String,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(&mut self, text: &str) {
        self.text.push_str(text);
        self.text.push('\n');
    }

    /// `label` padded to a column, then `value`
    pub fn field(&mut self, label: &str, value: impl std::fmt::Display) {
        self.line(&format!("{:<38} {}", label, value));
    }

    pub fn blank(&mut self) {
        self.text.push('\n');
    }

    pub fn into_string(self) -> String {
        self.text
    }
}

/// Pointer field as shown to the user
pub fn ptr(field: Field<KAddr>) -> String {
    match field {
        Field::Known(a) if a.is_null() => NULL_STR.to_string(),
        Field::Known(a) => format!("{:#x}", a.raw()),
        Field::Unreadable(a) => format!("<unreadable @ {:#x}>", a.raw()),
    }
}

fn hex<T: std::fmt::LowerHex>(field: Field<T>) -> String {
    match field {
        Field::Known(v) => format!("{:#x}", v),
        Field::Unreadable(a) => format!("<unreadable @ {:#x}>", a.raw()),
    }
}

fn symbol_or_na(symbols: &SymbolTable, field: Field<KAddr>) -> String {
    match field.non_null() {
        Some(a) => symbols.resolve(a),
        None => NA_STR.to_string(),
    }
}

fn next_pc_str(symbols: &SymbolTable, next_pc: &NextPc) -> String {
    match next_pc {
        NextPc::Address(a) if !a.is_null() => symbols.resolve(*a),
        NextPc::Unknown(reason) => format!("unknown ({})", reason),
        _ => NA_STR.to_string(),
    }
}

// ============================================================================
// Threads
// ============================================================================

/// One line of the thread table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRow {
    pub current: bool,
    pub user: bool,
    pub pid: String,
    pub process: String,
    pub tid: String,
    pub address: KAddr,
    pub continuation: String,
    pub next_pc: String,
}

impl ThreadRow {
    pub fn build<M: MemoryReader>(session: &Session<M>, symbols: &SymbolTable, thread: &Thread, current: Option<KAddr>) -> Self {
        let process = session
            .task_of(thread)
            .and_then(|task| session.process_of(&task));
        Self {
            current: current == Some(thread.address),
            user: thread.is_user(),
            pid: process
                .as_ref()
                .and_then(|p| p.pid.known())
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| NA_STR.to_string()),
            process: process.as_ref().map(|p| p.name_str().to_string()).unwrap_or_default(),
            tid: thread.thread_id.to_string(),
            address: thread.address,
            continuation: symbol_or_na(symbols, thread.continuation),
            next_pc: next_pc_str(symbols, &thread.next_pc),
        }
    }
}

/// Thread table with columns sized to their widest entry
pub fn thread_table(rows: &[ThreadRow]) -> String {
    let proc_w = rows.iter().map(|r| r.process.len()).max().unwrap_or(0).max(7);
    let cont_w = rows.iter().map(|r| r.continuation.len()).max().unwrap_or(0).max(12);
    let pc_w = rows.iter().map(|r| r.next_pc.len()).max().unwrap_or(0).max(7);

    let mut out = Report::new();
    out.line(&format!(
        "{:<4}| {:<6} | {:<proc_w$} | {:<8} | {:<18} | {:^cont_w$} | {:^pc_w$} |",
        "", "PID", "PROCESS", "TID", "THREAD", "CONTINUATION", "NEXT PC",
    ));
    for r in rows {
        out.line(&format!(
            "{}{} | {:<6} | {:<proc_w$} | {:<8} | {:<18} | {:^cont_w$} | {:^pc_w$} |",
            if r.current { '*' } else { ' ' },
            if r.user { "U " } else { "K " },
            format!("[{}]", r.pid),
            r.process,
            r.tid,
            r.address,
            r.continuation,
            r.next_pc,
        ));
    }
    out.line(&format!("TOTAL {}", rows.len()));
    out.into_string()
}

fn saved_state_lines(out: &mut Report, prefix: &str, state: &SavedRegisterState) {
    for (i, x) in state.x.iter().enumerate() {
        out.field(&format!("{}->x{}", prefix, i), hex(*x));
    }
    out.field(&format!("{}->fp", prefix), hex(state.fp));
    out.field(&format!("{}->lr", prefix), hex(state.lr));
    out.field(&format!("{}->sp", prefix), hex(state.sp));
    out.field(&format!("{}->pc", prefix), hex(state.pc));
    out.field(&format!("{}->cpsr", prefix), hex(state.cpsr));
    out.field(&format!("{}->far", prefix), hex(state.far));
    let esr = match state.esr {
        Field::Known(esr) => format!("{:#x} (class {:#04x})", esr, exception_class(esr)),
        Field::Unreadable(_) => hex(state.esr),
    };
    out.field(&format!("{}->esr", prefix), esr);
    out.field(&format!("{}->exception", prefix), hex(state.exception));
}

/// Everything known about one thread
pub fn thread_info<M: MemoryReader>(session: &Session<M>, symbols: &SymbolTable, thread: &Thread) -> String {
    let mut out = Report::new();
    out.line(if thread.is_user() {
        "This is a user space thread"
    } else {
        "This is a kernel thread"
    });
    out.blank();
    if let NextPc::Address(pc) = thread.next_pc {
        out.line(&format!("Next pc: {}", symbols.resolve(pc)));
        out.blank();
    }

    out.field("thread->task", ptr(thread.task));
    if let Some(task) = session.task_of(thread) {
        out.field("thread->task->bsd_info", ptr(task.bsd_info));
        if let Some(process) = session.process_of(&task) {
            out.field("thread->task->bsd_info->bsd_name", process.name_str());
            out.field("thread->task->bsd_info->bsd_pid", &process.pid);
        }
    }
    out.field("thread->tid", &thread.thread_id);
    out.field("thread->continuation", ptr(thread.continuation));
    out.field("thread->uContextData", ptr(thread.user_context));
    if let Some(state) = session.user_state_of(thread) {
        saved_state_lines(&mut out, "thread->uContextData", &state);
    }
    out.field("thread->kstackptr", ptr(thread.kernel_stack));
    if let Some(state) = session.kernel_state_of(thread) {
        saved_state_lines(&mut out, "thread->kstackptr", &state);
    }
    out.field("thread->voucher_ptr", ptr(thread.voucher));
    out.field("thread->ith_voucher_name", hex(thread.voucher_name));
    out.into_string()
}

// ============================================================================
// Tasks
// ============================================================================

/// One line of the task table
pub fn task_row<M: MemoryReader>(session: &Session<M>, task: &Task) -> String {
    let (pid, name) = match session.process_of(task) {
        Some(p) => (p.pid.to_string(), p.name_str().to_string()),
        None => (NA_STR.to_string(), String::new()),
    };
    format!(
        "[{:>5}] {:<33} task {:#x}  proc {}  space {}",
        pid,
        name,
        task.address.raw(),
        ptr(task.bsd_info),
        ptr(task.ipc_space),
    )
}

pub fn task_info<M: MemoryReader>(session: &Session<M>, task: &Task) -> String {
    let mut out = Report::new();
    if let Some(process) = session.process_of(task) {
        out.field("task->bsd_info->bsd_name", process.name_str());
        out.field("task->bsd_info->bsd_pid", &process.pid);
    }
    out.field("task->bsd_info", ptr(task.bsd_info));
    out.field("task->threads", format!("{:#x}", task.threads_anchor.raw()));
    out.field("task->itk_self", ptr(task.itk_self));
    if let Some(port) = session.self_port_of(task) {
        out.field("task->itk_self->io_bits", port.object.bits);
        out.field("task->itk_self->kobject", hex(port.kdata));
    }
    out.field("task->itk_nself", ptr(task.itk_nself));
    out.field("task->itk_sself", ptr(task.itk_sself));
    out.field("task->ipc_space", ptr(task.ipc_space));
    if let Some(space) = session.space_of(task) {
        out.field("task->ipc_space->is_table", ptr(space.table));
    }
    out.into_string()
}

// ============================================================================
// IPC
// ============================================================================

pub fn voucher_info(voucher: &Voucher) -> String {
    let mut out = Report::new();
    out.field("iv_hash", hex(voucher.hash));
    out.field("iv_sum", hex(voucher.sum));
    out.field("iv_refs", hex(voucher.refs));
    out.field("iv_table_size", hex(voucher.table_size));
    out.field("iv_inline_table", ptr(voucher.inline_table));
    out.field("iv_table", ptr(voucher.table));
    out.field("iv_port", ptr(voucher.port));
    out.field("iv_hash_link", ptr(voucher.hash_link));
    out.into_string()
}

pub fn port_info(port: &IpcPort) -> String {
    let mut out = Report::new();
    let object = &port.object;
    match object.bits {
        Field::Known(bits) => out.field("ip_object->io_bits", bits),
        Field::Unreadable(_) => out.field("ip_object->io_bits", hex(object.bits.map(|b| b.bits()))),
    }
    out.field("ip_object->io_references", hex(object.references));
    out.field("ip_object->io_lock_data[0]", hex(object.lock_data[0]));
    out.field("ip_object->io_lock_data[1]", hex(object.lock_data[1]));
    out.field("ipc_port->ip_messages", ptr(port.messages));
    out.field("ipc_port->data", hex(port.data));
    out.field("ipc_port->kdata", hex(port.kdata));
    out.field("ipc_port->ip_nsrequest", ptr(port.nsrequest));
    out.field("ipc_port->ip_pdrequest", ptr(port.pdrequest));
    out.field("ipc_port->ip_requests", ptr(port.requests));
    out.field("ipc_port->kdata2", hex(port.kdata2));
    out.field("ipc_port->ip_context", hex(port.context));
    match port.flags {
        Field::Known(f) => {
            out.field("ipc_port->ip_sprequests", f.sprequests());
            out.field("ipc_port->ip_spimportant", f.spimportant());
            out.field("ipc_port->ip_impdonation", f.impdonation());
            out.field("ipc_port->ip_tempowner", f.tempowner());
            out.field("ipc_port->ip_guarded", f.guarded());
            out.field("ipc_port->ip_strict_guard", f.strict_guard());
            out.field("ipc_port->ip_specialreply", f.specialreply());
            out.field("ipc_port->ip_sync_link_state", format!("{:#x}", f.sync_link_state()));
            out.field("ipc_port->ip_impcount", f.impcount());
        }
        Field::Unreadable(a) => out.field("ipc_port->flags", format!("<unreadable @ {:#x}>", a.raw())),
    }
    out.field("ipc_port->ip_mscount", &port.mscount);
    out.field("ipc_port->ip_srights", &port.srights);
    out.field("ipc_port->ip_sorights", &port.sorights);
    out.into_string()
}

pub fn space_info(space: &IpcSpace) -> String {
    let mut out = Report::new();
    out.field("ipc_space->is_table", ptr(space.table));
    out.field("ipc_space->is_table_size", format!("{} - (first reserved)", space.table_size));
    out.field("ipc_space->is_table_free", &space.table_free);
    out.into_string()
}

pub fn entry_row(entry: &IpcEntry) -> String {
    let rights = entry.rights();
    format!(
        "{:>6}  name {:#010x}  object {}  bits {}  urefs {}  [{}]",
        entry.index,
        port_name(entry),
        ptr(entry.object),
        hex(entry.bits),
        entry.urefs(),
        rights.join(","),
    )
}

/// User-visible port name: table index and generation
pub fn port_name(entry: &IpcEntry) -> u32 {
    let generation = entry.bits.map(crate::ipc::entry::ie_bits_gen).unwrap_or(0);
    ((entry.index as u32) << 8) | (generation >> 24)
}

// ============================================================================
// Zones
// ============================================================================

pub fn zone_info(zone: &Zone) -> String {
    let mut out = Report::new();
    out.line(&format!("Valid zone at {:#018x} at index {}", zone.address.raw(), zone.slot));
    out.line(&format!("        zone_name: {}", zone.name));
    out.line(&format!("        elem_size: {}", zone.elem_size));
    out.line(&format!("        index: {}", zone.index));
    out.line(&format!("        flags: {}", hex(zone.flags.map(|f| f.bits()))));
    out.line(&format!("        sum_count: {}", zone.sum_count));
    out.line(&format!("        page_count: {}", zone.page_count));
    out.line(&format!("        alloc_size: {}", hex(zone.alloc_size)));
    out.line(&format!("        max_size: {}", hex(zone.max_size)));
    out.line(&format!("        cur_size: {}", hex(zone.cur_size)));
    out.into_string()
}

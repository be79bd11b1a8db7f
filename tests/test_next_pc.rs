//! Integration tests for next-pc recovery of switched-out threads

mod common;

use common::SyntheticKernel;
use xnu_introspect::kern::{CurrentThread, NextPc, ThreadList, Unresolved};
use xnu_introspect::KAddr;

const THREAD: KAddr = KAddr(0xffff_fff0_3000_0000);
const USER_STATE: KAddr = KAddr(0xffff_fff0_3100_0000);
const KERNEL_STATE: KAddr = KAddr(0xffff_fff0_3200_0000);
const EXCEPTION_STATE: KAddr = KAddr(0xffff_fff0_3300_0000);
const SP: KAddr = KAddr(0xffff_fff0_3400_0000);

const THREAD_RUN_RET: KAddr = KAddr(0xffff_fff0_070e_7d0c);
const THREAD_BLOCK_REASON_RET: KAddr = KAddr(0xffff_fff0_070e_3554);
const EXCEPTION_RETURN: KAddr = KAddr(0xffff_fff0_070a_1800);

/// A thread with only a kernel stack, whose `thread_invoke` frame returns to `link`
fn switched_out(link: KAddr) -> SyntheticKernel {
    switched_out_on(SyntheticKernel::new(), link)
}

fn switched_out_on(mut k: SyntheticKernel, link: KAddr) -> SyntheticKernel {
    k.thread(THREAD);
    let kernel_stack = k.layout.thread.kernel_stack;
    k.set_thread_ptr(THREAD, kernel_stack, KERNEL_STATE);
    k.saved_state(KERNEL_STATE, KAddr(0xffff_fff0_070e_0000), SP);
    k.mem.map_zeroed(SP, 0x200);
    let stored_link = k.layout.next_pc.stored_link;
    k.mem.write_ptr(SP.offset(stored_link), link);
    k
}

fn caller_slot(k: &SyntheticKernel, offset: u64) -> KAddr {
    SP.offset(k.layout.next_pc.frame_size + offset)
}

#[test]
fn test_user_context_pc() {
    let user_pc = KAddr(0x1_0000_4bc0);
    let mut k = SyntheticKernel::new();
    k.thread(THREAD);
    let user_context = k.layout.thread.user_context;
    k.set_thread_ptr(THREAD, user_context, USER_STATE);
    k.saved_state(USER_STATE, user_pc, KAddr(0x1_6fdf_0000));
    let session = k.attach();

    let thread = session.thread(THREAD).unwrap();
    assert!(thread.is_user());
    assert_eq!(thread.next_pc, NextPc::Address(user_pc));
    assert_eq!(session.user_state_of(&thread).unwrap().pc_addr().known(), Some(user_pc));
}

#[test]
fn test_running_thread_reports_live_pc() {
    let live_pc = 0xffff_fff0_0712_3456;
    let mut k = SyntheticKernel::new();
    k.thread(THREAD);
    k.mem.set_register("TPIDR_EL1", THREAD.raw());
    k.mem.set_register("pc", live_pc);
    let session = k.attach();

    assert_eq!(session.thread(THREAD).unwrap().next_pc, NextPc::Address(KAddr(live_pc)));
}

#[test]
fn test_unwind_through_thread_block_reason() {
    let resume = KAddr(0xffff_fff0_0710_0a20);
    let mut k = switched_out(THREAD_BLOCK_REASON_RET);
    let slot = caller_slot(&k, 0x48);
    k.mem.write_ptr(slot, resume);
    let session = k.attach();

    assert_eq!(session.thread(THREAD).unwrap().next_pc, NextPc::Address(resume));
}

#[test]
fn test_unwind_through_thread_run() {
    let resume = KAddr(0xffff_fff0_0710_0b40);
    let mut k = switched_out(THREAD_RUN_RET);
    let slot = caller_slot(&k, 0x38);
    k.mem.write_ptr(slot, resume);
    let session = k.attach();

    assert_eq!(session.thread(THREAD).unwrap().next_pc, NextPc::Address(resume));
}

#[test]
fn test_unknown_caller_is_unknown() {
    let stray = KAddr(0xffff_fff0_0700_0004);
    let session = switched_out(stray).attach();

    assert_eq!(
        session.thread(THREAD).unwrap().next_pc,
        NextPc::Unknown(Unresolved::UnknownCaller { sp: SP, observed: stray })
    );
}

#[test]
fn test_exception_return_follows_x21() {
    let faulting_pc = KAddr(0xffff_fff0_0720_1000);
    let mut k = switched_out(THREAD_RUN_RET);
    let (candidate, x21) = (caller_slot(&k, 0x38), caller_slot(&k, k.layout.next_pc.x21_slot));
    k.mem.write_ptr(candidate, EXCEPTION_RETURN);
    k.mem.write_ptr(x21, EXCEPTION_STATE);
    k.saved_state(EXCEPTION_STATE, faulting_pc, SP);
    let session = k.attach();

    assert_eq!(session.thread(THREAD).unwrap().next_pc, NextPc::Address(faulting_pc));
}

#[test]
fn test_exception_return_with_null_x21_is_unknown() {
    let mut k = switched_out(THREAD_BLOCK_REASON_RET);
    let candidate = caller_slot(&k, 0x48);
    k.mem.write_ptr(candidate, EXCEPTION_RETURN);
    let session = k.attach();

    let next_pc = session.thread(THREAD).unwrap().next_pc;
    assert_eq!(next_pc, NextPc::Unknown(Unresolved::NullExceptionFrame { sp: SP }));
    assert_eq!(next_pc.to_string(), "unknown");
    assert!(next_pc.into_result(THREAD).is_err());
}

#[test]
fn test_unreadable_frame_is_unknown() {
    let mut k = SyntheticKernel::new();
    k.thread(THREAD);
    let kernel_stack = k.layout.thread.kernel_stack;
    k.set_thread_ptr(THREAD, kernel_stack, KERNEL_STATE);
    // sp points at memory that is not in the image
    k.saved_state(KERNEL_STATE, KAddr::NULL, SP);
    let session = k.attach();

    assert!(matches!(
        session.thread(THREAD).unwrap().next_pc,
        NextPc::Unknown(Unresolved::UnreadableFrame { .. })
    ));
}

#[test]
fn test_absent_thread_is_not_applicable() {
    let session = SyntheticKernel::new().attach();
    let next_pc = session.next_pc(None);
    assert_eq!(next_pc, NextPc::NotApplicable);
    assert_eq!(next_pc.to_string(), "N/A");
}

#[test]
fn test_missing_current_thread_register_leaves_kernel_pc_unknown() {
    let mut k = switched_out_on(SyntheticKernel::without_current_thread(), THREAD_RUN_RET);
    let slot = caller_slot(&k, 0x38);
    k.mem.write_ptr(slot, KAddr(0xffff_fff0_0710_0b40));
    k.mem.set_register("pc", 0xffff_fff0_0712_3456);
    k.link_global_threads(&[THREAD]);
    let session = k.attach();

    assert_eq!(session.current(), CurrentThread::Unavailable);
    let expected = NextPc::Unknown(Unresolved::CurrentThreadUnknown);
    assert_eq!(session.thread(THREAD).unwrap().next_pc, expected);
    let walked = session.threads(ThreadList::Global).unwrap().next().unwrap().unwrap();
    assert_eq!(walked.next_pc, expected);
}

#[test]
fn test_missing_current_thread_register_keeps_user_pc() {
    let user_pc = KAddr(0x1_0000_4bc0);
    let mut k = SyntheticKernel::without_current_thread();
    k.thread(THREAD);
    let (user_context, kernel_stack) = (k.layout.thread.user_context, k.layout.thread.kernel_stack);
    k.set_thread_ptr(THREAD, user_context, USER_STATE);
    k.set_thread_ptr(THREAD, kernel_stack, KERNEL_STATE);
    k.saved_state(USER_STATE, user_pc, KAddr(0x1_6fdf_0000));
    let session = k.attach();

    assert_eq!(session.thread(THREAD).unwrap().next_pc, NextPc::Address(user_pc));
}

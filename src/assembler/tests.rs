// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Erik van der Tier

use super::{compile, compile_file, compile_with_observer, AssemblerOptions, AssemblerOutput, CompileObserver};
use crate::core::assembler::error::ErrorCode;
use crate::core::expr::ExpressionValue;
use crate::z80::SpectrumModel;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

fn compile_ok(source: &str) -> AssemblerOutput {
    let output = compile(source, &AssemblerOptions::default());
    assert!(
        !output.has_errors(),
        "unexpected errors: {:?}",
        output
            .errors
            .iter()
            .map(|err| format!("{} {}", err.code.code(), err.message))
            .collect::<Vec<_>>()
    );
    output
}

fn codes(output: &AssemblerOutput) -> Vec<ErrorCode> {
    output.errors.iter().map(|err| err.code).collect()
}

fn error_codes(source: &str) -> Vec<ErrorCode> {
    codes(&compile(source, &AssemblerOptions::default()))
}

fn bytes(source: &str) -> Vec<u8> {
    compile_ok(source).binary()
}

fn symbol(output: &AssemblerOutput, name: &str) -> i64 {
    match output.symbols.get(name).map(|info| &info.value) {
        Some(ExpressionValue::Integer(value)) => *value,
        other => panic!("symbol '{name}' has no integer value: {other:?}"),
    }
}

fn create_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("target")
        .join("test-tmp")
        .join(format!("zxasm-{label}-{}-{nanos}", process::id()));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

#[derive(Default)]
struct RecordingObserver {
    traces: Vec<String>,
    yields: usize,
}

impl CompileObserver for RecordingObserver {
    fn trace(&mut self, message: &str) {
        self.traces.push(message.to_string());
    }

    fn yield_point(&mut self, _processed_lines: usize) {
        self.yields += 1;
    }
}

#[test]
fn org_starts_a_segment_at_the_given_address() {
    let output = compile_ok(".org #6000\nld a,b\nnop");
    assert_eq!(output.segments.len(), 1);
    assert_eq!(output.segments[0].start_address, 0x6000);
    assert_eq!(output.segments[0].emitted_code, vec![0x78, 0x00]);
}

#[test]
fn single_org_round_trip() {
    let output = compile_ok(".org #6400\nnop");
    assert_eq!(output.segments.len(), 1);
    assert_eq!(output.segments[0].start_address, 0x6400);
    assert_eq!(output.segments[0].emitted_code, vec![0x00]);
}

#[test]
fn code_without_org_lands_at_the_default_address() {
    let output = compile_ok("Start: nop");
    assert_eq!(output.segments[0].start_address, 0x8000);
    assert_eq!(symbol(&output, "start"), 0x8000);
}

#[test]
fn default_start_address_comes_from_the_options() {
    let options = AssemblerOptions {
        default_start_address: Some(0x6000),
        ..AssemblerOptions::default()
    };
    let output = compile("Start: nop", &options);
    assert_eq!(output.segments[0].start_address, 0x6000);
}

#[test]
fn a_second_org_opens_a_new_segment() {
    let output = compile_ok(".org #6000\nnop\n.org #7000\nhalt");
    assert_eq!(output.segments.len(), 2);
    assert_eq!(output.segments[1].start_address, 0x7000);
    assert_eq!(output.binary(), vec![0x00, 0x76]);
}

#[test]
fn org_label_takes_the_new_address() {
    let output = compile_ok("nop\nSecond: .org #9000\nnop");
    assert_eq!(symbol(&output, "second"), 0x9000);
}

#[test]
fn duplicated_label_is_reported() {
    let output = compile("Start: nop\nStart: nop", &AssemblerOptions::default());
    assert_eq!(codes(&output), vec![ErrorCode::Z0501]);
    assert_eq!(output.errors[0].line, 2);
    assert!(output.segments.is_empty());
}

#[test]
fn equ_cannot_rebind_a_symbol() {
    assert_eq!(
        error_codes("MySymbol .equ 200\nnop\nMySymbol .equ 300"),
        vec![ErrorCode::Z0501]
    );
}

#[test]
fn assignment_shorthands_set_variables() {
    assert_eq!(bytes("Value = 2\nValue := Value * 3\n.defb Value"), vec![6]);
}

#[test]
fn symbols_are_case_insensitive_by_default() {
    assert_eq!(error_codes("Start: nop\nSTART: nop"), vec![ErrorCode::Z0501]);
    let options = AssemblerOptions {
        use_case_sensitive_symbols: true,
        ..AssemblerOptions::default()
    };
    let output = compile("Start: nop\nSTART: nop", &options);
    assert!(!output.has_errors());
}

#[test]
fn predefined_symbols_are_visible_to_expressions() {
    let mut options = AssemblerOptions::default();
    options.predefined_symbols.insert("LEVEL".to_string(), 3);
    let output = compile(".defb LEVEL * 2", &options);
    assert_eq!(output.binary(), vec![6]);
}

#[test]
fn entry_address_resolves_forward_references() {
    let output = compile_ok(".org #6789\n.ent MyStart\nld a,b\nMyStart: nop");
    assert_eq!(output.entry_address, Some(0x678A));
}

#[test]
fn xent_sets_the_export_entry() {
    let output = compile_ok(".xent #7000\nnop");
    assert_eq!(output.export_entry_address, Some(0x7000));
}

#[test]
fn jr_forward_reference_is_fixed_up() {
    assert_eq!(bytes("jr Target\nnop\nTarget: nop"), vec![0x18, 0x01, 0x00, 0x00]);
}

#[test]
fn jr_backward_reference_is_negative() {
    assert_eq!(bytes("Back: nop\njr Back"), vec![0x00, 0x18, 0xFD]);
}

#[test]
fn relative_jump_out_of_range_is_reported() {
    assert_eq!(
        error_codes("Back: nop\n.defs 200\njr Back"),
        vec![ErrorCode::Z0403]
    );
    assert_eq!(
        error_codes("jr Target\n.defs 200\nTarget: nop"),
        vec![ErrorCode::Z0403]
    );
}

#[test]
fn mixed_case_names_are_not_keywords() {
    assert_eq!(bytes("Test: ret\njp Test"), vec![0xC9, 0xC3, 0x00, 0x80]);
    assert_eq!(bytes("Mul: nop\njr Mul"), vec![0x00, 0x18, 0xFD]);
    let output = compile_ok("Mirror .equ 3\nSet = 4\n.defb Mirror, Set");
    assert_eq!(symbol(&output, "mirror"), 3);
    assert_eq!(output.binary(), vec![3, 4]);
    assert_eq!(bytes("NOP\nLD A,B\nHALT"), vec![0x00, 0x78, 0x76]);
}

#[test]
fn extern_is_accepted_and_ignored() {
    assert_eq!(bytes(".extern\nnop\nextern\nEXTERN"), vec![0x00]);
}

#[test]
fn fixups_see_variables_as_they_were_at_the_use_site() {
    let source = "x = 0\n.loop 3\n ld a,Fwd+x\nx = x + 1\n.endl\nFwd .equ 10";
    assert_eq!(bytes(source), vec![0x3E, 0x0A, 0x3E, 0x0B, 0x3E, 0x0C]);
}

#[test]
fn forward_word_reference_is_fixed_up() {
    assert_eq!(bytes("ld hl,Data\nData: .defb 1"), vec![0x21, 0x03, 0x80, 0x01]);
}

#[test]
fn unresolved_symbol_is_reported_after_fixups() {
    assert_eq!(error_codes("ld hl,Nowhere"), vec![ErrorCode::Z0605]);
}

#[test]
fn equ_and_var_bind_values() {
    let output = compile_ok("Size: .equ 4\nCounter: .var 1\nCounter: .var Counter + Size\n.defb Counter");
    assert_eq!(symbol(&output, "size"), 4);
    assert_eq!(output.binary(), vec![5]);
}

#[test]
fn data_pragmas_emit_bytes() {
    assert_eq!(bytes(".defb 1, 2, #FF"), vec![1, 2, 0xFF]);
    assert_eq!(bytes(".defw #1234, 5"), vec![0x34, 0x12, 0x05, 0x00]);
    assert_eq!(bytes(".defm \"AB\""), vec![b'A', b'B']);
    assert_eq!(bytes(".defn \"AB\""), vec![b'A', b'B', 0]);
    assert_eq!(bytes(".defc \"AB\""), vec![b'A', b'B' | 0x80]);
    assert_eq!(bytes(".defh \"12AB\""), vec![0x12, 0xAB]);
    assert_eq!(bytes(".defs 3"), vec![0, 0, 0]);
    assert_eq!(bytes(".fillb 2, #E5"), vec![0xE5, 0xE5]);
    assert_eq!(bytes(".fillw 2, #1234"), vec![0x34, 0x12, 0x34, 0x12]);
}

#[test]
fn string_in_defb_needs_flexible_defs() {
    assert_eq!(error_codes(".defb \"A\""), vec![ErrorCode::Z0601]);
    let options = AssemblerOptions {
        flexible_def_pragmas: true,
        ..AssemblerOptions::default()
    };
    let output = compile(".defb \"A\"", &options);
    assert_eq!(output.binary(), vec![b'A']);
}

#[test]
fn defh_rejects_odd_digits() {
    assert_eq!(error_codes(".defh \"123\""), vec![ErrorCode::Z0317]);
}

#[test]
fn skip_and_align_pad_the_segment() {
    let output = compile_ok(".org #8000\nnop\n.skip #8003\nhalt");
    assert_eq!(output.binary(), vec![0x00, 0xFF, 0xFF, 0x76]);
    let output = compile_ok(".org #8001\n.align 4\nAligned: nop");
    assert_eq!(symbol(&output, "aligned"), 0x8004);
    assert_eq!(error_codes(".org #8004\n.skip #8002"), vec![ErrorCode::Z0313]);
}

#[test]
fn defg_and_defgx_emit_pixel_rows() {
    assert_eq!(bytes(".defg XX..XX.."), vec![0xCC]);
    assert_eq!(bytes(".defg ....XXXX XXXX...."), vec![0x0F, 0xF0]);
    assert_eq!(bytes(".defgx \">XXX\""), vec![0x07]);
    assert_eq!(bytes(".defgx \"<XXX\""), vec![0xE0]);
}

#[test]
fn trace_output_is_collected_and_forwarded() {
    let mut observer = RecordingObserver::default();
    let output = compile_with_observer(
        ".trace \"Value: \", 3+4\n.tracehex 255, \"A\"",
        "main.asm",
        &AssemblerOptions::default(),
        &mut observer,
    );
    assert!(!output.has_errors());
    assert_eq!(output.trace_output, vec!["Value: 7".to_string(), "00ff41".to_string()]);
    assert_eq!(observer.traces, output.trace_output);
}

#[test]
fn observer_yields_every_n_lines() {
    let mut observer = RecordingObserver::default();
    let options = AssemblerOptions {
        yield_every_lines: 2,
        ..AssemblerOptions::default()
    };
    compile_with_observer("nop\nnop\nnop\nnop", "main.asm", &options, &mut observer);
    assert_eq!(observer.yields, 2);
}

#[test]
fn error_pragma_reports_its_message() {
    let output = compile(".error \"boom\"", &AssemblerOptions::default());
    assert_eq!(codes(&output), vec![ErrorCode::Z2000]);
    assert_eq!(output.errors[0].message, "Error: boom");
}

#[test]
fn dot_exported_labels_go_to_output_symbols() {
    let output = compile_ok("nop\n.Exported: nop");
    assert_eq!(
        output.output_symbols.get("exported").map(|info| &info.value),
        Some(&ExpressionValue::Integer(0x8001))
    );
}

#[test]
fn loop_repeats_its_body_with_counter() {
    assert_eq!(bytes(".loop 3\n.defb $cnt\n.endl"), vec![1, 2, 3]);
}

#[test]
fn loop_labels_are_local_to_the_iteration() {
    let output = compile_ok(".loop 2\nInner: nop\n.endl\nAfter: nop");
    assert!(output.symbols.get("inner").is_none());
    assert_eq!(symbol(&output, "after"), 0x8002);
}

#[test]
fn loop_count_is_capped() {
    assert_eq!(error_codes(".loop #10000\nnop\n.endl"), vec![ErrorCode::Z0702]);
    assert_eq!(error_codes(".loop #FFFF + 1\n.endl"), vec![ErrorCode::Z0702]);
}

#[test]
fn loop_stops_after_too_many_errors() {
    let options = AssemblerOptions {
        max_loop_errors_to_report: 3,
        ..AssemblerOptions::default()
    };
    let output = compile(".loop 10\n.trace undefinedSym\n.endl", &options);
    assert_eq!(
        codes(&output),
        vec![ErrorCode::Z0605, ErrorCode::Z0605, ErrorCode::Z0605, ErrorCode::Z0703]
    );
    assert_eq!(output.errors[3].line, 1);
}

#[test]
fn missing_loop_end_is_reported() {
    assert_eq!(error_codes(".loop 2\nnop"), vec![ErrorCode::Z0701]);
    assert_eq!(error_codes(".endl"), vec![ErrorCode::Z0704]);
}

#[test]
fn while_and_repeat_loops_evaluate_conditions() {
    assert_eq!(
        bytes("Count: .var 0\n.while Count < 3\n.defb Count\nCount: .var Count + 1\n.endw"),
        vec![0, 1, 2]
    );
    assert_eq!(
        bytes("Count: .var 5\n.repeat\n.defb Count\nCount: .var Count + 1\n.until Count > 6"),
        vec![5, 6]
    );
}

#[test]
fn for_loop_steps_through_the_range() {
    assert_eq!(bytes(".for i = 1 to 7 .step 3\n.defb i\n.next"), vec![1, 4, 7]);
    assert_eq!(bytes(".for i = 3 to 1 .step -1\n.defb i\n.next"), vec![3, 2, 1]);
    assert_eq!(error_codes(".for i = 1 to 3 .step 0\nnop\n.next"), vec![ErrorCode::Z0706]);
}

#[test]
fn empty_for_loop_still_binds_its_label() {
    let output = compile_ok("MyLoop: .for i = 1 to 0\nnop\n.next");
    assert_eq!(symbol(&output, "myloop"), 0x8000);
    assert!(output.binary().is_empty());
    let output = compile_ok("MyLoop: .for _i = 1 .to 3\n.next");
    assert_eq!(symbol(&output, "myloop"), 0x8000);
}

#[test]
fn break_and_continue_control_the_loop() {
    assert_eq!(
        bytes(".loop 5\n.if $cnt == 3\n.break\n.endif\n.defb $cnt\n.endl"),
        vec![1, 2]
    );
    assert_eq!(
        bytes(".loop 3\n.if $cnt == 2\n.continue\n.endif\n.defb $cnt\n.endl"),
        vec![1, 3]
    );
    assert_eq!(error_codes(".break"), vec![ErrorCode::Z0707]);
    assert_eq!(error_codes(".continue"), vec![ErrorCode::Z0708]);
}

#[test]
fn if_selects_the_first_true_section() {
    let source = "Mode: .equ 2\n.if Mode == 1\n.defb 1\n.elif Mode == 2\n.defb 2\n.elif Mode > 0\n.defb 3\n.else\n.defb 4\n.endif";
    assert_eq!(bytes(source), vec![2]);
    assert_eq!(bytes(".if false\n.defb 1\n.else\n.defb 4\n.endif"), vec![4]);
    assert!(bytes(".if false\n.defb 1\n.endif").is_empty());
}

#[test]
fn if_rejects_sections_after_else() {
    let source = ".if false\nnop\n.else\nnop\n.elif true\nnop\n.endif";
    assert_eq!(error_codes(source), vec![ErrorCode::Z0709]);
}

#[test]
fn ifused_checks_symbol_usage() {
    let source = "Used: nop\nUnused: nop\nld hl,Used\n.ifused Used\n.defb 1\n.endif\n.ifnused Unused\n.defb 2\n.endif";
    assert_eq!(bytes(source), vec![0x00, 0x00, 0x21, 0x00, 0x80, 0x01, 0x02]);
}

#[test]
fn proc_labels_stay_local() {
    let output = compile_ok(".proc\nInner: nop\n.endp\nInner: nop");
    assert_eq!(symbol(&output, "inner"), 0x8001);
}

#[test]
fn local_requires_a_proc() {
    assert_eq!(error_codes(".local First"), vec![ErrorCode::Z0504]);
}

#[test]
fn macro_arguments_are_substituted() {
    let source = "Copy: .macro(src, dst)\nld hl,{{src}}\nld de,{{dst}}\n.endm\nCopy(#4000, #5800)";
    assert_eq!(bytes(source), vec![0x21, 0x00, 0x40, 0x11, 0x00, 0x58]);
}

#[test]
fn macro_invocation_produces_one_list_item() {
    let output = compile_ok("nop\nTwo: .macro()\nnop\nnop\n.endm\nTwo()");
    let items: Vec<_> = output
        .list_file_items
        .iter()
        .filter(|item| item.is_macro_invocation)
        .collect();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].address, 0x8001);
    assert_eq!(items[0].line_number, 6);
    assert_eq!(output.binary(), vec![0, 0, 0]);
}

#[test]
fn macro_argument_count_is_checked() {
    let source = "Single: .macro(value)\n.defb {{value}}\n.endm\nSingle(1, 2)";
    assert_eq!(error_codes(source), vec![ErrorCode::Z1008]);
    assert_eq!(error_codes("Missing()"), vec![ErrorCode::Z1007]);
}

#[test]
fn errors_inside_macros_carry_the_invocation() {
    let source = "Broken: .macro()\n.error \"inside\"\n.endm\nBroken()";
    let output = compile(source, &AssemblerOptions::default());
    assert_eq!(codes(&output), vec![ErrorCode::Z1012, ErrorCode::Z2000]);
    assert_eq!(output.errors[0].line, 4);
    assert!(output.errors[1]
        .message
        .starts_with("(from macro invocation through line 4)"));
}

#[test]
fn macro_parameter_outside_a_macro_is_reported() {
    assert_eq!(error_codes("ld a,{{value}}"), vec![ErrorCode::Z1011]);
}

#[test]
fn struct_invocation_emits_default_bytes() {
    let source = "Point: .struct\nx: .defb 1\ny: .defw 2\n.ends\nPoint()";
    let output = compile_ok(source);
    assert_eq!(symbol(&output, "point"), 3);
    assert_eq!(output.binary(), vec![1, 2, 0]);
}

#[test]
fn struct_fields_can_be_overridden() {
    let source = "Point: .struct\nx: .defb 1\ny: .defw 2\n.ends\nPoint()\ny -> .defw 3";
    assert_eq!(bytes(source), vec![1, 3, 0]);
}

#[test]
fn struct_field_overrides_resolve_forward_references() {
    let source = "Point: .struct\nx: .defb 1\ny: .defw 2\n.ends\nPoint()\nx -> .defb Small\ny -> .defw Later\nLater: nop\nSmall .equ 7";
    assert_eq!(bytes(source), vec![7, 0x03, 0x80, 0x00]);
}

#[test]
fn struct_field_errors_are_reported() {
    let head = "Point: .struct\nx: .defb 1\n.ends\n";
    assert_eq!(
        error_codes(&format!("{head}Point()\nz -> .defb 3")),
        vec![ErrorCode::Z0802]
    );
    assert_eq!(
        error_codes(&format!("{head}Point()\nx -> .defw 3")),
        vec![ErrorCode::Z0801]
    );
    assert_eq!(error_codes("x -> .defb 3"), vec![ErrorCode::Z0803]);
    assert_eq!(
        error_codes(&format!("{head}Point(1)")),
        vec![ErrorCode::Z0809]
    );
}

#[test]
fn struct_body_accepts_only_data_pragmas() {
    assert_eq!(
        error_codes("Bad: .struct\nnop\n.ends"),
        vec![ErrorCode::Z0808]
    );
}

#[test]
fn modules_keep_their_own_symbols() {
    let source = "Utils: .module\nStart: nop\n.endmodule\nStart: nop\nld hl,Utils.Start";
    let output = compile_ok(source);
    assert_eq!(symbol(&output, "start"), 0x8001);
    assert_eq!(&output.binary()[2..], &[0x21, 0x00, 0x80]);
}

#[test]
fn global_prefix_reaches_the_root_module() {
    let source = "Value: .equ 7\n.module Inner\nValue: .equ 9\n.defb Value, ::Value\n.endmodule";
    assert_eq!(bytes(source), vec![9, 7]);
}

#[test]
fn module_errors_are_reported() {
    assert_eq!(
        error_codes(".module A\n.endmodule\n.module A\n.endmodule"),
        vec![ErrorCode::Z0903]
    );
    assert_eq!(error_codes(".module\n.endmodule"), vec![ErrorCode::Z0901]);
    assert_eq!(
        error_codes(".loop 1\n.module A\n.endmodule\n.endl"),
        vec![ErrorCode::Z0904]
    );
}

#[test]
fn bank_requires_a_banked_model() {
    assert_eq!(error_codes(".bank 1"), vec![ErrorCode::Z0308]);
    let output = compile_ok(".model Spectrum128\n.bank 3\nnop");
    assert_eq!(output.model_type, Some(SpectrumModel::Spectrum128));
    assert_eq!(output.segments[0].bank, Some(3));
    assert_eq!(output.segments[0].start_address, 0xC000);
    assert_eq!(
        error_codes(".model Spectrum128\n.bank 8"),
        vec![ErrorCode::Z0306]
    );
    assert_eq!(
        error_codes(".model Spectrum128\n.bank 1\nnop\n.bank 1"),
        vec![ErrorCode::Z0309]
    );
}

#[test]
fn bank_overflow_is_reported_once() {
    let source = ".model Spectrum128\n.bank 4\n.org #8000\n.defs #4000, #34\n.defb 0\n.defb 0";
    assert_eq!(error_codes(source), vec![ErrorCode::Z0411]);
}

#[test]
fn model_from_options_enables_banks() {
    let options = AssemblerOptions {
        current_model: Some(SpectrumModel::Spectrum128),
        ..AssemblerOptions::default()
    };
    let output = compile(".bank 2\nnop", &options);
    assert!(!output.has_errors());
    assert_eq!(output.segments[0].bank, Some(2));
}

#[test]
fn next_instructions_need_the_next_model() {
    assert_eq!(error_codes("swapnib"), vec![ErrorCode::Z0414]);
    let output = compile_ok(".model Next\nswapnib");
    assert_eq!(output.binary(), vec![0xED, 0x23]);
}

#[test]
fn includebin_reads_a_slice_of_a_file() {
    let dir = create_temp_dir("includebin");
    fs::write(dir.join("data.bin"), [1u8, 2, 3, 4, 5]).expect("write data");
    let source = dir.join("main.asm");
    fs::write(&source, ".includebin \"data.bin\", 1, 3\n.includebin \"data.bin\"").expect("write source");

    let output = compile_file(&source, &AssemblerOptions::default()).expect("compile");
    assert!(!output.has_errors(), "{:?}", codes(&output));
    assert_eq!(output.binary(), vec![2, 3, 4, 1, 2, 3, 4, 5]);

    fs::write(&source, ".includebin \"data.bin\", 9").expect("write source");
    let output = compile_file(&source, &AssemblerOptions::default()).expect("compile");
    assert_eq!(codes(&output), vec![ErrorCode::Z0320]);

    fs::write(&source, ".includebin \"missing.bin\"").expect("write source");
    let output = compile_file(&source, &AssemblerOptions::default()).expect("compile");
    assert_eq!(codes(&output), vec![ErrorCode::Z0322]);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn comparebin_checks_the_emitted_code() {
    let dir = create_temp_dir("comparebin");
    fs::write(dir.join("expected.bin"), [0x00u8, 0x76, 0xC9]).expect("write data");
    let source = dir.join("main.asm");

    fs::write(&source, "nop\nhalt\n.comparebin \"expected.bin\"").expect("write source");
    let output = compile_file(&source, &AssemblerOptions::default()).expect("compile");
    assert!(!output.has_errors(), "{:?}", codes(&output));
    assert_eq!(output.compare_bins.len(), 1);
    assert_eq!(output.compare_bins[0].segment_length, 2);

    fs::write(&source, "nop\nret\n.comparebin \"expected.bin\"").expect("write source");
    let output = compile_file(&source, &AssemblerOptions::default()).expect("compile");
    assert_eq!(codes(&output), vec![ErrorCode::Z0330]);
    assert!(output.errors[0].message.contains("offset 1"));

    fs::write(&source, "nop\nhalt\nret\nnop\n.comparebin \"expected.bin\"").expect("write source");
    let output = compile_file(&source, &AssemblerOptions::default()).expect("compile");
    assert_eq!(codes(&output), vec![ErrorCode::Z0330]);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn included_files_contribute_lines() {
    let dir = create_temp_dir("include");
    fs::write(dir.join("lib.asm"), "Helper: ret").expect("write lib");
    let source = dir.join("main.asm");
    fs::write(&source, "call Helper\n#include \"lib.asm\"").expect("write source");

    let output = compile_file(&source, &AssemblerOptions::default()).expect("compile");
    assert!(!output.has_errors(), "{:?}", codes(&output));
    assert_eq!(output.source_file_list.len(), 2);
    assert_eq!(output.binary(), vec![0xCD, 0x03, 0x80, 0xC9]);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn unreadable_root_file_is_an_error() {
    let dir = create_temp_dir("missing");
    let result = compile_file(&dir.join("nope.asm"), &AssemblerOptions::default());
    assert!(result.is_err());
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn source_map_and_address_map_follow_instructions() {
    let output = compile_ok("nop\nld a,b");
    let line = output.source_map.get(&0x8001u16).expect("mapped address");
    assert_eq!(line.line, 2);
    assert_eq!(output.address_map[&0usize][&2u32], vec![0x8001]);
}

#[test]
fn output_serializes_to_json() {
    let output = compile_ok(".org #8000\nStart: nop");
    let json = output.to_json().expect("json");
    let value: serde_json::Value = serde_json::from_str(&json).expect("parse json");
    assert!(value.is_object());
}

#[test]
fn listing_shows_addresses_and_bytes() {
    let output = compile_ok(".org #8000\nld a,b");
    let mut listing = Vec::new();
    output.write_listing(&mut listing).expect("listing");
    let text = String::from_utf8(listing).expect("utf-8");
    assert!(text.contains("8000"), "{text}");
    assert!(text.contains("78"), "{text}");
}

#[test]
fn disp_shifts_label_addresses_but_not_the_output() {
    assert_eq!(
        bytes(".org #8000\n.disp #20\nnop\ncall Test\nhalt\nTest: ret"),
        vec![0x00, 0xCD, 0x25, 0x80, 0x76, 0xC9]
    );
    assert_eq!(
        bytes(".org #8000\n.disp -#20\nnop\ncall Test\nhalt\nTest: ret"),
        vec![0x00, 0xCD, 0xE5, 0x7F, 0x76, 0xC9]
    );
}

#[test]
fn disp_applies_from_the_line_where_it_appears() {
    assert_eq!(
        bytes(".org #8000\nnop\n.disp #100\nThis: ld bc, this\ncall Test\nhalt\nTest: ret"),
        vec![0x00, 0x01, 0x01, 0x81, 0xCD, 0x08, 0x81, 0x76, 0xC9]
    );
    assert_eq!(
        bytes(".org #8000\nnop\nThis: ld bc, this\n.disp #100\ncall Test\nhalt\nTest: ret"),
        vec![0x00, 0x01, 0x01, 0x80, 0xCD, 0x08, 0x81, 0x76, 0xC9]
    );
}

#[test]
fn relative_jumps_across_a_disp_change() {
    assert_eq!(
        bytes(".org #8000\nnop\n.disp #100\nThis: jr Test\nhalt\nTest: ret"),
        vec![0x00, 0x18, 0x01, 0x76, 0xC9]
    );
    assert_eq!(
        error_codes(".org #8000\nnop\nThis: jr Test\n.disp #100\nhalt\nTest: ret"),
        vec![ErrorCode::Z0403]
    );
}

//! Trace-to-ninja pipeline tests over a replayed event stream.

use std::io::Write;
use std::time::Duration;

use buildtrace::engine;
use buildtrace::events::{
    ReplaySource, StopToken, TraceEvent, DISPOSITION_CREATE, DISPOSITION_OPEN_EXISTING,
};
use buildtrace::model::TraceModel;
use buildtrace::ninja;
use buildtrace::postprocess;

fn correlate(root: i32, events: Vec<TraceEvent>) -> TraceModel {
    engine::run(
        ReplaySource::new(events),
        root,
        Duration::from_secs(5),
        StopToken::new(),
    )
    .unwrap()
}

fn start(pid: i32, parent: i32, command_line: &str) -> TraceEvent {
    TraceEvent::ProcessStart {
        pid,
        parent,
        command_line: command_line.to_string(),
        name: command_line.split(' ').next().unwrap_or("").to_string(),
    }
}

#[test]
fn test_single_compile_end_to_end() {
    let trace = correlate(
        100,
        vec![
            start(101, 100, "cc foo.c"),
            TraceEvent::FileRead {
                pid: 101,
                path: "foo.c".to_string(),
            },
            TraceEvent::FileWrite {
                pid: 101,
                path: "foo.o".to_string(),
            },
            TraceEvent::ProcessStop {
                pid: 101,
                parent: 100,
                name: "cc".to_string(),
            },
        ],
    );

    assert_eq!(trace.processes.len(), 2);
    let cc = &trace.processes[1];
    assert_eq!(cc.reads, vec!["foo.c"]);
    assert_eq!(cc.writes, vec!["foo.o"]);

    let commands = postprocess::post_process(&trace);
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].command_line, "cc foo.c");

    assert_eq!(
        ninja::commands_to_ninja(&commands),
        "rule r0\n command = cc foo.c\nbuild foo.o: r0 foo.c\n\n"
    );
}

#[test]
fn test_response_file_flows_into_ninja_rule() {
    // The linker writes its arguments to a temp rsp file, reads it back and
    // deletes it; the emitted rule must regenerate the file transparently.
    let dir = tempfile::tempdir().unwrap();
    let rsp_path = dir.path().join("tmp1f00.rsp");
    let mut file = std::fs::File::create(&rsp_path).unwrap();
    // UTF-8 BOM, as compiler drivers commonly write.
    file.write_all(b"\xEF\xBB\xBFmain.o -out:app.exe").unwrap();
    drop(file);
    let rsp = rsp_path.to_string_lossy().to_string();

    let events = vec![
        start(101, 100, &format!("link @{rsp}")),
        TraceEvent::FileCreate {
            pid: 101,
            path: rsp.clone(),
            disposition: DISPOSITION_CREATE,
            share_access: 0,
            create_options: 0,
        },
        TraceEvent::FileRead {
            pid: 101,
            path: rsp.clone(),
        },
        TraceEvent::FileRead {
            pid: 101,
            path: "/src/main.o".to_string(),
        },
        TraceEvent::FileWrite {
            pid: 101,
            path: "/out/app.exe".to_string(),
        },
    ];
    let trace = correlate(100, events);
    std::fs::remove_file(&rsp_path).ok();

    let commands = postprocess::post_process(&trace);
    assert_eq!(commands.len(), 1);
    let captured = commands[0].rsp_file.as_ref().unwrap();
    assert_eq!(captured.file_name, rsp);
    assert_eq!(captured.contents, "main.o -out:app.exe");

    let doc = ninja::commands_to_ninja(&commands);
    assert!(doc.contains(&format!(" rspfile = {rsp}\n")));
    assert!(doc.contains(" rspfile_content = main.o -out:app.exe\n"));
    assert!(doc.contains("build /out/app.exe: r0 /src/main.o\n"));
}

#[test]
fn test_mapped_library_becomes_plain_input() {
    let trace = correlate(
        100,
        vec![
            start(101, 100, "cc foo.c"),
            TraceEvent::FileCreate {
                pid: 101,
                path: "/usr/lib/lib.dll".to_string(),
                disposition: DISPOSITION_OPEN_EXISTING,
                share_access: 0,
                create_options: 0,
            },
            TraceEvent::FileMap {
                pid: 101,
                path: "/usr/lib/lib.dll".to_string(),
            },
            TraceEvent::FileWrite {
                pid: 101,
                path: "/out/foo.o".to_string(),
            },
        ],
    );

    let commands = postprocess::post_process(&trace);
    assert_eq!(commands[0].file_reads, vec!["/usr/lib/lib.dll"]);
    assert_eq!(
        ninja::commands_to_ninja(&commands),
        "rule r0\n command = cc foo.c\nbuild /out/foo.o: r0 /usr/lib/lib.dll\n\n"
    );
}

#[test]
fn test_multi_command_build_keeps_discovery_order() {
    let trace = correlate(
        100,
        vec![
            start(101, 100, "cc a.c"),
            TraceEvent::FileRead {
                pid: 101,
                path: "/src/a.c".to_string(),
            },
            TraceEvent::FileWrite {
                pid: 101,
                path: "/out/a.o".to_string(),
            },
            start(102, 100, "cc b.c"),
            TraceEvent::FileRead {
                pid: 102,
                path: "/src/b.c".to_string(),
            },
            TraceEvent::FileWrite {
                pid: 102,
                path: "/out/b.o".to_string(),
            },
            start(103, 100, "link a.o b.o"),
            TraceEvent::FileRead {
                pid: 103,
                path: "/out/a.o".to_string(),
            },
            TraceEvent::FileRead {
                pid: 103,
                path: "/out/b.o".to_string(),
            },
            TraceEvent::FileWrite {
                pid: 103,
                path: "/out/app".to_string(),
            },
        ],
    );

    let commands = postprocess::post_process(&trace);
    let lines: Vec<&str> = commands.iter().map(|c| c.command_line.as_str()).collect();
    assert_eq!(lines, vec!["cc a.c", "cc b.c", "link a.o b.o"]);

    let doc = ninja::commands_to_ninja(&commands);
    assert!(doc.contains("build /out/a.o: r0 /src/a.c\n"));
    assert!(doc.contains("build /out/b.o: r1 /src/b.c\n"));
    assert!(doc.contains("build /out/app: r2 /out/a.o /out/b.o\n"));
}

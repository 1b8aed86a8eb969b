use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tatara::action::{Concat, CopyFile, FnAction};
use tatara::config::{CacheMode, ChangePolicy, Order};
use tatara::scanner::IncludeScanner;
use tatara::{
    Action, ActionContext, BuildError, BuildReport, BuildStatus, ConfigError, Engine, Graph, NodeId, NodeState,
    Options, TataraError,
};

/// Wraps an action and counts how often it runs.
struct Counted<A> {
    inner: A,
    runs: Arc<AtomicUsize>,
}

impl<A: Action> Action for Counted<A> {
    fn identity(&self) -> Cow<'_, str> {
        self.inner.identity()
    }

    fn execute(&self, context: &ActionContext) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(context)
    }
}

struct Project {
    _dir: tempfile::TempDir,
    root: Utf8PathBuf,
    runs: Arc<AtomicUsize>,
}

impl Project {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        Self {
            _dir: dir,
            root,
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn path(&self, name: &str) -> Utf8PathBuf {
        self.root.join(name)
    }

    fn write(&self, name: &str, content: &str) {
        let path = self.path(name);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn read(&self, name: &str) -> String {
        fs::read_to_string(self.path(name)).unwrap()
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    fn counted<A: Action>(&self, inner: A) -> Counted<A> {
        Counted {
            inner,
            runs: self.runs.clone(),
        }
    }

    fn options(&self) -> tatara::config::OptionsBuilder {
        Options::builder().database(self.path(".tatara/db.cbor"))
    }

    /// `app` <- concat(`a.o`, `b.o`), `a.o` <- copy(`a.txt`), `b.o` <- copy(`b.txt`)
    fn program(&self) -> (Graph, NodeId) {
        let mut graph = Graph::new();
        let a_src = graph.add_node(self.path("a.txt"));
        let b_src = graph.add_node(self.path("b.txt"));
        let a_obj = graph.add_node(self.path("a.o"));
        let b_obj = graph.add_node(self.path("b.o"));
        let app = graph.add_node(self.path("app"));

        graph.add_dependency(a_obj, a_src);
        graph.add_dependency(b_obj, b_src);
        graph.add_dependency(app, a_obj);
        graph.add_dependency(app, b_obj);

        graph.set_action(a_obj, self.counted(CopyFile));
        graph.set_action(b_obj, self.counted(CopyFile));
        graph.set_action(app, self.counted(Concat));

        (graph, app)
    }
}

fn states(report: &BuildReport) -> BTreeMap<String, NodeState> {
    report
        .nodes
        .values()
        .map(|node| (node.key.to_string(), node.state))
        .collect()
}

fn state(report: &BuildReport, graph: &Graph, key: impl AsRef<str>) -> NodeState {
    let id = graph.get(key.as_ref()).unwrap();
    report.state(id).unwrap()
}

#[test]
fn every_node_reaches_a_terminal_state() {
    let project = Project::new();
    project.write("a.txt", "a");
    // b.txt is missing, so half of the program can't be built.
    let (graph, app) = project.program();

    let options = project.options().keep_going(true).build();
    let mut engine = Engine::new(graph, options).unwrap();
    let report = engine.build(&[app]).unwrap();

    assert_eq!(report.status, BuildStatus::Failed);
    assert!(report.nodes.values().all(|node| node.state.is_terminal()));

    let graph = engine.graph();
    assert_eq!(state(&report, graph, project.path("a.o")), NodeState::Built);
    assert_eq!(state(&report, graph, project.path("b.txt")), NodeState::Failed);
    assert_eq!(state(&report, graph, project.path("b.o")), NodeState::Failed);
    assert_eq!(state(&report, graph, project.path("app")), NodeState::Failed);

    let missing = report.find(project.path("b.txt").as_str()).unwrap();
    let error = missing.error.as_ref().unwrap().to_string();
    assert_eq!(error, BuildError::MissingSource(project.path("b.txt").as_str().into()).to_string());
}

#[test]
fn rerun_without_changes_executes_nothing() {
    let project = Project::new();
    project.write("a.txt", "alpha\n");
    project.write("b.txt", "beta\n");
    let (graph, app) = project.program();

    let mut engine = Engine::new(graph, project.options().build()).unwrap();
    let first = engine.build(&[app]).unwrap();
    assert_eq!(first.status, BuildStatus::Success);
    assert_eq!(first.executed, 3);
    assert_eq!(project.read("app"), "alpha\nbeta\n");

    let second = engine.build(&[app]).unwrap();
    assert_eq!(second.executed, 0);
    assert!(second.nodes.values().all(|node| node.state == NodeState::UpToDate));

    // A fresh engine reading the persisted database agrees.
    let (graph, app) = project.program();
    let mut engine = Engine::new(graph, project.options().build()).unwrap();
    let third = engine.build(&[app]).unwrap();
    assert_eq!(third.executed, 0);
    assert_eq!(states(&second), states(&third));
    assert_eq!(project.runs(), 3);
}

#[test]
fn changed_source_rebuilds_only_its_dependents() {
    let project = Project::new();
    project.write("a.txt", "alpha\n");
    project.write("b.txt", "beta\n");
    let (graph, app) = project.program();

    let mut engine = Engine::new(graph, project.options().build()).unwrap();
    engine.build(&[app]).unwrap();

    project.write("a.txt", "ALPHA\n");
    let report = engine.build(&[app]).unwrap();

    let graph = engine.graph();
    assert_eq!(state(&report, graph, project.path("a.o")), NodeState::Built);
    assert_eq!(state(&report, graph, project.path("b.o")), NodeState::UpToDate);
    assert_eq!(state(&report, graph, project.path("app")), NodeState::Built);
    assert_eq!(report.executed, 2);
    assert_eq!(project.read("app"), "ALPHA\nbeta\n");
}

#[test]
fn parallelism_does_not_change_the_outcome() {
    let mut outcomes = Vec::new();

    for (jobs, order) in [(1, Order::Deterministic), (4, Order::Deterministic), (4, Order::Random)] {
        let project = Project::new();
        let mut graph = Graph::new();
        let all = graph.add_alias("all");

        for i in 0..12 {
            let name = format!("src{i}.txt");
            project.write(&name, &format!("{i}\n"));
            let src = graph.add_node(project.path(&name));
            let obj = graph.add_node(project.path(&format!("obj{i}")));
            graph.add_dependency(obj, src);
            graph.set_action(obj, CopyFile);
            graph.add_dependency(all, obj);
        }
        let bundle = graph.add_node(project.path("bundle"));
        let objects: Vec<NodeId> = graph.children(all);
        for obj in objects {
            graph.add_dependency(bundle, obj);
        }
        graph.set_action(bundle, Concat);
        graph.add_dependency(all, bundle);

        let options = Options::builder()
            .jobs(jobs)
            .unwrap()
            .order(order)
            .random_seed(7)
            .build();
        let mut engine = Engine::new(graph, options).unwrap();
        let report = engine.build(&[all]).unwrap();

        let states: BTreeMap<String, NodeState> = report
            .nodes
            .values()
            .map(|node| {
                let key = node.key.strip_prefix(project.root.as_str()).unwrap_or(&*node.key);
                (key.to_string(), node.state)
            })
            .collect();
        outcomes.push((states, project.read("bundle")));
    }

    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[0], outcomes[2]);
    assert_eq!(outcomes[0].1, (0..12).map(|i| format!("{i}\n")).collect::<String>());
}

#[test]
fn cycle_is_rejected_before_anything_runs() {
    let project = Project::new();
    let mut graph = Graph::new();
    let a = graph.add_node(project.path("A"));
    let b = graph.add_node(project.path("B"));
    let c = graph.add_node(project.path("C"));
    graph.add_dependency(a, b);
    graph.add_dependency(b, a);

    let written = project.path("C");
    graph.set_action(
        c,
        project.counted(FnAction::new("touch", move |_| {
            fs::write(&written, "c")?;
            Ok(())
        })),
    );

    let mut engine = Engine::new(graph, project.options().build()).unwrap();
    let err = engine.build(&[a, c]).unwrap_err();

    let cycles = match err {
        TataraError::Config(ConfigError::Cycle(cycles)) => cycles,
        other => panic!("expected a cycle error, got {other}"),
    };
    assert_eq!(cycles.len(), 1);
    assert_eq!(cycles[0].first(), cycles[0].last());
    assert_eq!(project.runs(), 0);
    assert!(!project.path("C").exists());
    assert!(!project.path(".tatara/db.cbor").exists());
}

#[test]
fn cache_restores_output_without_running_the_action() {
    let project = Project::new();
    project.write("in.txt", "cached bytes\n");

    let graph = || {
        let mut graph = Graph::new();
        let src = graph.add_node(project.path("in.txt"));
        let out = graph.add_node(project.path("out/t.txt"));
        graph.add_dependency(out, src);
        graph.set_action(
            out,
            project.counted(FnAction::new("transform", |ctx| {
                let text = fs::read_to_string(&ctx.inputs[0])?;
                fs::create_dir_all(ctx.outputs[0].parent().unwrap())?;
                fs::write(&ctx.outputs[0], text.to_uppercase())?;
                Ok(())
            })),
        );
        (graph, out)
    };
    let options = || Options::builder().cache_dir(project.path("cache")).build();

    let (g, out) = graph();
    let mut engine = Engine::new(g, options()).unwrap();
    let first = engine.build(&[out]).unwrap();
    assert_eq!(first.executed, 1);
    assert_eq!(first.cache_hits, 0);

    fs::remove_file(project.path("out/t.txt")).unwrap();

    // A new engine starts with an empty in-memory signature database.
    let (g, out) = graph();
    let mut engine = Engine::new(g, options()).unwrap();
    let second = engine.build(&[out]).unwrap();
    assert_eq!(second.executed, 0);
    assert_eq!(second.cache_hits, 1);
    assert_eq!(second.state(out), Some(NodeState::Built));
    assert!(second.node(out).unwrap().cache_hit);
    assert_eq!(project.runs(), 1);

    let entries: Vec<Utf8PathBuf> = fs::read_dir(project.path("cache"))
        .unwrap()
        .flat_map(|shard| fs::read_dir(shard.unwrap().path()).unwrap())
        .map(|entry| Utf8PathBuf::try_from(entry.unwrap().path()).unwrap())
        .collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(fs::read(&entries[0]).unwrap(), fs::read(project.path("out/t.txt")).unwrap());
    assert_eq!(project.read("out/t.txt"), "CACHED BYTES\n");
}

#[test]
fn dry_run_reports_without_touching_anything() {
    let project = Project::new();
    project.write("a.txt", "alpha\n");
    project.write("b.txt", "beta\n");
    let (graph, app) = project.program();

    let mut engine = Engine::new(graph, project.options().build()).unwrap();
    engine.build(&[app]).unwrap();

    project.write("b.txt", "BETA\n");
    let db_before = fs::read(project.path(".tatara/db.cbor")).unwrap();

    let (mut graph, app) = project.program();
    let generated = graph.add_node(project.path("gen.txt"));
    graph.set_action(
        generated,
        project.counted(FnAction::new("generate", |ctx| {
            fs::write(&ctx.outputs[0], "gen")?;
            Ok(())
        })),
    );
    graph.add_dependency(app, generated);

    let options = project.options().dry_run(true).build();
    let mut engine = Engine::new(graph, options).unwrap();
    let report = engine.build(&[app]).unwrap();

    let graph = engine.graph();
    assert_eq!(state(&report, graph, project.path("gen.txt")), NodeState::NeedsBuild);
    assert_eq!(state(&report, graph, project.path("b.o")), NodeState::NeedsBuild);
    assert_eq!(state(&report, graph, project.path("a.o")), NodeState::UpToDate);
    assert_eq!(state(&report, graph, project.path("app")), NodeState::NeedsBuild);
    assert_eq!(report.status, BuildStatus::Success);
    assert_eq!(report.executed, 0);

    assert_eq!(project.runs(), 3);
    assert!(!project.path("gen.txt").exists());
    assert_eq!(project.read("app"), "alpha\nbeta\n");
    assert_eq!(fs::read(project.path(".tatara/db.cbor")).unwrap(), db_before);
}

fn failing_graph(project: &Project) -> (Graph, NodeId) {
    let mut graph = Graph::new();
    let bad = graph.add_node(project.path("bad"));
    let good1 = graph.add_node(project.path("good1"));
    let good2 = graph.add_node(project.path("good2"));
    let all = graph.add_alias("all");

    graph.set_action(bad, project.counted(FnAction::new("fail", |_| anyhow::bail!("exit status 1"))));
    for id in [good1, good2] {
        graph.set_action(
            id,
            project.counted(FnAction::new("write", |ctx| {
                fs::write(&ctx.outputs[0], "ok")?;
                Ok(())
            })),
        );
    }
    for id in [bad, good1, good2] {
        graph.add_dependency(all, id);
    }
    (graph, all)
}

#[test]
fn stop_on_first_error_admits_nothing_new() {
    let project = Project::new();
    let (graph, all) = failing_graph(&project);

    let mut engine = Engine::new(graph, Options::default()).unwrap();
    let report = engine.build(&[all]).unwrap();

    assert_eq!(report.status, BuildStatus::Failed);
    assert_eq!(report.status.exit_code(), 2);
    assert_eq!(project.runs(), 1);
    assert!(report.nodes.values().all(|node| node.state == NodeState::Failed));

    let stopped = report.find(project.path("good1").as_str()).unwrap();
    assert_eq!(
        stopped.error.as_ref().unwrap().to_string(),
        BuildError::Stopped.to_string()
    );
}

#[test]
fn missing_source_stops_the_build() {
    let project = Project::new();
    project.write("b.txt", "beta\n");

    let mut graph = Graph::new();
    let all = graph.add_alias("all");
    let a = graph.add_node(project.path("a.txt"));
    let b_obj = graph.add_node(project.path("b.o"));
    let b_src = graph.add_node(project.path("b.txt"));
    graph.add_dependency(b_obj, b_src);
    graph.set_action(b_obj, project.counted(CopyFile));
    graph.add_dependency(all, a);
    graph.add_dependency(all, b_obj);

    let mut engine = Engine::new(graph, Options::default()).unwrap();
    let report = engine.build(&[all]).unwrap();

    assert_eq!(report.status, BuildStatus::Failed);
    assert_eq!(project.runs(), 0);
    assert_eq!(report.state(a), Some(NodeState::Failed));

    let stopped = report.node(b_obj).unwrap();
    assert_eq!(stopped.state, NodeState::Failed);
    assert_eq!(
        stopped.error.as_ref().unwrap().to_string(),
        BuildError::Stopped.to_string()
    );
    assert!(!project.path("b.o").exists());
}

#[test]
fn keep_going_finishes_unrelated_branches() {
    let project = Project::new();
    let (graph, all) = failing_graph(&project);

    let options = Options::builder().keep_going(true).build();
    let mut engine = Engine::new(graph, options).unwrap();
    let report = engine.build(&[all]).unwrap();

    let graph = engine.graph();
    assert_eq!(report.status, BuildStatus::Failed);
    assert_eq!(project.runs(), 3);
    assert_eq!(state(&report, graph, project.path("bad")), NodeState::Failed);
    assert_eq!(state(&report, graph, project.path("good1")), NodeState::Built);
    assert_eq!(state(&report, graph, project.path("good2")), NodeState::Built);
    assert_eq!(state(&report, graph, "all"), NodeState::Failed);

    let all_error = report.find("all").unwrap().error.as_ref().unwrap().to_string();
    assert!(all_error.contains("bad"));
}

#[test]
fn ignore_errors_lets_dependents_build() {
    let project = Project::new();
    project.write("src.txt", "src\n");

    let graph = || {
        let mut graph = Graph::new();
        let src = graph.add_node(project.path("src.txt"));
        let flaky = graph.add_node(project.path("flaky"));
        let app = graph.add_node(project.path("app"));
        graph.set_action(flaky, project.counted(FnAction::new("flaky", |_| anyhow::bail!("flaked"))));
        graph.attributes_mut(flaky).ignore_errors = true;
        graph.add_dependency(app, src);
        graph.add_dependency(app, flaky);
        graph.set_action(app, project.counted(CopyFile));
        (graph, app, flaky)
    };

    let (g, app, flaky) = graph();
    let mut engine = Engine::new(g, project.options().build()).unwrap();
    let report = engine.build(&[app]).unwrap();

    assert_eq!(report.status, BuildStatus::Success);
    assert_eq!(report.state(flaky), Some(NodeState::Built));
    assert!(report.node(flaky).unwrap().warning.is_some());
    assert_eq!(report.state(app), Some(NodeState::Built));
    assert_eq!(project.read("app"), "src\n");

    // The failure is retried on the next run; the dependent saw the same
    // inputs and stays up to date.
    let (g, app, flaky) = graph();
    let mut engine = Engine::new(g, project.options().build()).unwrap();
    let report = engine.build(&[app]).unwrap();
    assert_eq!(report.state(flaky), Some(NodeState::Built));
    assert_eq!(report.state(app), Some(NodeState::UpToDate));
    assert_eq!(project.runs(), 3);
}

#[test]
fn question_mode_builds_nothing() {
    let project = Project::new();
    project.write("a.txt", "alpha\n");
    project.write("b.txt", "beta\n");

    let (graph, app) = project.program();
    let mut engine = Engine::new(graph, project.options().question(true).build()).unwrap();
    let report = engine.build(&[app]).unwrap();
    assert_eq!(report.status, BuildStatus::NotUpToDate);
    assert_eq!(report.status.exit_code(), 1);
    assert_eq!(project.runs(), 0);
    assert!(!project.path("app").exists());

    let (graph, app) = project.program();
    let mut engine = Engine::new(graph, project.options().build()).unwrap();
    engine.build(&[app]).unwrap();

    let (graph, app) = project.program();
    let mut engine = Engine::new(graph, project.options().question(true).build()).unwrap();
    let report = engine.build(&[app]).unwrap();
    assert_eq!(report.status, BuildStatus::UpToDate);
    assert_eq!(report.status.exit_code(), 0);
    assert_eq!(project.runs(), 3);
}

#[test]
fn always_build_runs_every_time() {
    let project = Project::new();
    let mut graph = Graph::new();
    let stamp = graph.add_node(project.path("stamp"));
    graph.set_action(
        stamp,
        project.counted(FnAction::new("stamp", |ctx| {
            fs::write(&ctx.outputs[0], "now")?;
            Ok(())
        })),
    );
    graph.attributes_mut(stamp).always_build = true;

    let mut engine = Engine::new(graph, Options::default()).unwrap();
    for _ in 0..3 {
        let report = engine.build(&[stamp]).unwrap();
        assert_eq!(report.state(stamp), Some(NodeState::Built));
    }
    assert_eq!(project.runs(), 3);
}

#[test]
fn changed_action_identity_rebuilds() {
    let project = Project::new();
    project.write("in.txt", "x");

    let graph = |identity: &'static str| {
        let mut graph = Graph::new();
        let src = graph.add_node(project.path("in.txt"));
        let out = graph.add_node(project.path("out.txt"));
        graph.add_dependency(out, src);
        graph.set_action(
            out,
            project.counted(FnAction::new(identity, |ctx| {
                fs::copy(&ctx.inputs[0], &ctx.outputs[0])?;
                Ok(())
            })),
        );
        (graph, out)
    };

    for (identity, expected) in [("cp", NodeState::Built), ("cp", NodeState::UpToDate), ("cp -p", NodeState::Built)] {
        let (g, out) = graph(identity);
        let mut engine = Engine::new(g, project.options().build()).unwrap();
        let report = engine.build(&[out]).unwrap();
        assert_eq!(report.state(out), Some(expected), "identity {identity}");
    }
    assert_eq!(project.runs(), 2);
}

#[test]
fn missing_output_is_rebuilt() {
    let project = Project::new();
    project.write("a.txt", "alpha\n");
    project.write("b.txt", "beta\n");
    let (graph, app) = project.program();

    let mut engine = Engine::new(graph, project.options().build()).unwrap();
    engine.build(&[app]).unwrap();

    fs::remove_file(project.path("app")).unwrap();
    let report = engine.build(&[app]).unwrap();
    assert_eq!(report.state(app), Some(NodeState::Built));
    assert_eq!(report.executed, 1);
    assert_eq!(project.read("app"), "alpha\nbeta\n");
}

#[test]
fn precious_outputs_survive_until_the_action_runs() {
    let project = Project::new();
    project.write("in.txt", "v1");
    project.write("precious.out", "old");
    project.write("plain.out", "old");

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut graph = Graph::new();
    let src = graph.add_node(project.path("in.txt"));
    for name in ["precious.out", "plain.out"] {
        let out = graph.add_node(project.path(name));
        graph.add_dependency(out, src);
        let seen = seen.clone();
        graph.set_action(
            out,
            FnAction::new("update", move |ctx| {
                let existed = ctx.outputs[0].exists();
                seen.lock().unwrap().push((ctx.target.to_string(), existed));
                fs::copy(&ctx.inputs[0], &ctx.outputs[0])?;
                Ok(())
            }),
        );
    }
    graph.attributes_mut(graph.get(project.path("precious.out").as_str()).unwrap()).precious = true;

    let mut engine = Engine::new(graph, Options::default()).unwrap();
    engine.build_all().unwrap();

    let seen = seen.lock().unwrap().clone();
    assert!(seen.contains(&(project.path("precious.out").into_string(), true)));
    assert!(seen.contains(&(project.path("plain.out").into_string(), false)));
}

#[test]
fn producers_of_a_side_effect_never_overlap() {
    let project = Project::new();
    let writing = Arc::new(AtomicBool::new(false));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let mut graph = Graph::new();
    let log = graph.add_node(project.path("build.log"));
    let all = graph.add_alias("all");

    for i in 0..4 {
        let out = graph.add_node(project.path(&format!("out{i}")));
        let (writing, overlaps) = (writing.clone(), overlaps.clone());
        graph.set_action(
            out,
            FnAction::new("log", move |ctx: &ActionContext| {
                if writing.swap(true, Ordering::SeqCst) {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                std::thread::sleep(Duration::from_millis(5));
                fs::write(&ctx.outputs[0], "out")?;
                fs::write(&ctx.outputs[1], ctx.target)?;
                writing.store(false, Ordering::SeqCst);
                Ok(())
            }),
        );
        graph.add_side_effect(out, log);
        graph.add_dependency(all, out);
    }

    let options = Options::builder().jobs(4).unwrap().build();
    let mut engine = Engine::new(graph, options).unwrap();
    let report = engine.build(&[all]).unwrap();

    assert_eq!(report.status, BuildStatus::Success);
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

#[test]
fn header_changes_rebuild_through_implicit_dependencies() {
    let project = Project::new();
    project.write("main.c", "#include \"util.h\"\nint main;\n");
    project.write("util.h", "#define X 1\n");
    project.write("other.c", "int other;\n");

    let graph = || {
        let mut graph = Graph::new();
        let all = graph.add_alias("all");
        for name in ["main", "other"] {
            let src = graph.add_node(project.path(&format!("{name}.c")));
            let obj = graph.add_node(project.path(&format!("{name}.o")));
            graph.add_dependency(obj, src);
            graph.set_action(obj, project.counted(CopyFile));
            graph.set_scanner(obj, IncludeScanner::default());
            graph.add_dependency(all, obj);
        }
        (graph, all)
    };

    let (g, all) = graph();
    let mut engine = Engine::new(g, project.options().build()).unwrap();
    engine.build(&[all]).unwrap();
    let main_o = engine.graph().get(project.path("main.o").as_str()).unwrap();
    let header = engine.graph().get(project.path("util.h").as_str()).unwrap();
    assert!(engine.graph().children(main_o).contains(&header));
    assert_eq!(project.runs(), 2);

    project.write("util.h", "#define X 2\n");
    let (g, all) = graph();
    let mut engine = Engine::new(g, project.options().build()).unwrap();
    let report = engine.build(&[all]).unwrap();

    let graph = engine.graph();
    assert_eq!(state(&report, graph, project.path("main.o")), NodeState::Built);
    assert_eq!(state(&report, graph, project.path("other.o")), NodeState::UpToDate);
    assert_eq!(project.runs(), 3);
}

#[test]
fn removed_include_drops_the_implicit_dependency() {
    let project = Project::new();
    project.write("main.c", "#include \"util.h\"\nint main;\n");
    project.write("util.h", "#define X 1\n");

    let mut graph = Graph::new();
    let src = graph.add_node(project.path("main.c"));
    let obj = graph.add_node(project.path("main.o"));
    graph.add_dependency(obj, src);
    graph.set_action(obj, project.counted(CopyFile));
    graph.set_scanner(obj, IncludeScanner::default());

    let options = project.options().change_policy(ChangePolicy::Content).build();
    let mut engine = Engine::new(graph, options).unwrap();
    assert_eq!(engine.build(&[obj]).unwrap().status, BuildStatus::Success);
    assert_eq!(engine.graph().children(obj).len(), 2);

    project.write("main.c", "int main;\n");
    fs::remove_file(project.path("util.h")).unwrap();

    let report = engine.build(&[obj]).unwrap();
    assert_eq!(report.status, BuildStatus::Success);
    assert_eq!(report.state(obj), Some(NodeState::Built));
    assert_eq!(engine.graph().children(obj), [src]);
    assert_eq!(project.read("main.o"), "int main;\n");

    // The header's node outlives the include but is not built on its own.
    let report = engine.build_all().unwrap();
    assert_eq!(report.status, BuildStatus::Success);
    assert_eq!(report.nodes.len(), 2);
    assert_eq!(project.runs(), 2);
}

#[test]
fn cache_debug_reports_every_node() {
    let project = Project::new();
    project.write("a.txt", "alpha\n");
    project.write("b.txt", "beta\n");

    let debug = project.path("logs/cache-debug.txt");
    let verdicts = || -> BTreeMap<String, String> {
        fs::read_to_string(&debug)
            .unwrap()
            .lines()
            .map(|line| {
                let mut parts = line.splitn(3, ' ');
                let mode = parts.next().unwrap();
                let verdict = parts.next().unwrap();
                let key = parts.next().unwrap();
                let name = Utf8Path::new(key).file_name().unwrap().to_string();
                (name, format!("{mode} {verdict}"))
            })
            .collect()
    };

    let (graph, app) = project.program();
    let options = project
        .options()
        .cache_dir(project.path("cache"))
        .cache_debug(&debug)
        .build();
    let mut engine = Engine::new(graph, options).unwrap();

    engine.build(&[app]).unwrap();
    let first = verdicts();
    assert_eq!(first.len(), 5);
    assert_eq!(first["a.txt"], "normal source");
    assert_eq!(first["a.o"], "normal miss");
    assert_eq!(first["app"], "normal miss");

    engine.build(&[app]).unwrap();
    let second = verdicts();
    assert_eq!(second.len(), 5);
    assert_eq!(second["a.o"], "normal fresh");
    assert_eq!(second["app"], "normal fresh");

    fs::remove_file(project.path("app")).unwrap();
    let (graph, app) = project.program();
    let options = project
        .options()
        .cache_mode(CacheMode::Disabled)
        .cache_dir(project.path("cache"))
        .cache_debug(&debug)
        .build();
    let mut engine = Engine::new(graph, options).unwrap();
    let report = engine.build(&[app]).unwrap();

    assert_eq!(report.cache_hits, 0);
    let third = verdicts();
    assert_eq!(third.len(), 5);
    assert_eq!(third["b.o"], "disabled fresh");
    assert_eq!(third["app"], "disabled bypass");
}

#[test]
fn trace_records_every_transition() {
    let project = Project::new();
    project.write("a.txt", "alpha\n");
    project.write("b.txt", "beta\n");
    let (graph, app) = project.program();

    let trace = project.path("logs/trace.jsonl");
    let options = project.options().trace(&trace).build();
    let mut engine = Engine::new(graph, options).unwrap();
    engine.build(&[app]).unwrap();

    let records: Vec<serde_json::Value> = fs::read_to_string(&trace)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    let app_key = project.path("app").into_string();
    let app_states: Vec<&str> = records
        .iter()
        .filter(|record| record["node"] == app_key.as_str())
        .map(|record| record["to"].as_str().unwrap())
        .collect();
    assert_eq!(app_states, ["pending", "needs-build", "executing", "built"]);

    let built = records
        .iter()
        .find(|record| record["node"] == app_key.as_str() && record["to"] == "built")
        .unwrap();
    assert_eq!(built["outcome"], "executed");

    let sources = records
        .iter()
        .filter(|record| record["to"] == "up-to-date")
        .count();
    assert_eq!(sources, 2);
    assert!(Utf8Path::new(&trace).is_file());
}

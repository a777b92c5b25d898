use zoekt_execution::validate_custom_workflow_code;

#[test]
fn allows_from_runtime_import_zoekt_tools() {
    let code = "\nfrom runtime import zoekt_tools\n\ndef run(args):\n    return zoekt_tools.list_repos()\n";
    assert_eq!(validate_custom_workflow_code(code), Vec::<String>::new());
}

#[test]
fn allows_runtime_zoekt_tools_import_with_alias() {
    let code = "\nimport runtime.zoekt_tools as zoekt_tools\n\ndef run(args):\n    return zoekt_tools.list_repos()\n";
    assert_eq!(validate_custom_workflow_code(code), Vec::<String>::new());
}

#[test]
fn rejects_non_zoekt_tools_runtime_from_import() {
    let code = "\nfrom runtime import dangerous\n\ndef run(args):\n    return dangerous\n";
    assert_eq!(
        validate_custom_workflow_code(code),
        vec!["disallowed_import: runtime.dangerous".to_string()]
    );
}

#[test]
fn allows_descendants_of_allowed_roots() {
    let code = "\nimport asyncio.queues\nfrom json import loads\n\ndef run(args):\n    return loads('{}')\n";
    assert_eq!(validate_custom_workflow_code(code), Vec::<String>::new());
}

#[test]
fn banned_roots_cover_dotted_descendants() {
    let code = "\nimport os.path\n\ndef run(args):\n    return None\n";
    assert_eq!(
        validate_custom_workflow_code(code),
        vec!["banned_import: os.path".to_string()]
    );
}

#[test]
fn from_import_of_banned_root_is_banned_per_name() {
    let code = "\nfrom os import environ\n\ndef run(args):\n    return None\n";
    assert_eq!(
        validate_custom_workflow_code(code),
        vec!["banned_import: os.environ".to_string()]
    );
}

#[test]
fn unrelated_imports_are_disallowed() {
    let code = "\nimport requests\n\ndef run(args):\n    return None\n";
    assert_eq!(
        validate_custom_workflow_code(code),
        vec!["disallowed_import: requests".to_string()]
    );
}

#[test]
fn banned_calls_match_bare_names_and_attribute_access() {
    let code = "\ndef run(args):\n    eval('1')\n    helper.open('/etc/passwd')\n    return None\n";
    assert_eq!(
        validate_custom_workflow_code(code),
        vec![
            "banned_call: eval".to_string(),
            "banned_call: open".to_string(),
        ]
    );
}

#[test]
fn rejections_are_deduplicated_preserving_first_occurrence() {
    let code = "\nimport socket\nimport socket\n\ndef run(args):\n    eval('1')\n    eval('2')\n    return None\n";
    assert_eq!(
        validate_custom_workflow_code(code),
        vec![
            "banned_import: socket".to_string(),
            "banned_call: eval".to_string(),
        ]
    );
}

#[test]
fn syntax_errors_short_circuit_with_a_single_rejection() {
    let rejections = validate_custom_workflow_code("def run(args:\n    return 1\n");
    assert_eq!(rejections.len(), 1);
    assert!(rejections[0].starts_with("syntax_error: "));
    assert!(rejections[0].contains("at line"));
}

#[test]
fn missing_entrypoints_are_each_named() {
    let rejections = validate_custom_workflow_code("x = 1\n");
    assert_eq!(
        rejections,
        vec![
            "missing_required_entrypoint: run(args) or async run(args)".to_string(),
            "missing_required_entrypoint: parse_args (legacy mode)".to_string(),
            "missing_required_entrypoint: main (legacy mode)".to_string(),
            "missing_required_entrypoint: if __name__ == '__main__' (legacy mode)".to_string(),
        ]
    );
}

#[test]
fn async_run_satisfies_the_entrypoint_contract() {
    let code = "\nimport asyncio\n\nasync def run(args):\n    await asyncio.sleep(0)\n    return {}\n";
    assert_eq!(validate_custom_workflow_code(code), Vec::<String>::new());
}

#[test]
fn legacy_triple_satisfies_the_entrypoint_contract() {
    let code = concat!(
        "import argparse\n",
        "import json\n",
        "import sys\n",
        "\n",
        "def parse_args(argv=None):\n",
        "    parser = argparse.ArgumentParser()\n",
        "    parser.add_argument('--args-json', required=True)\n",
        "    return parser.parse_args(argv)\n",
        "\n",
        "def main():\n",
        "    cli = parse_args()\n",
        "    print(json.dumps({'ok': True}))\n",
        "    return 0\n",
        "\n",
        "if __name__ == '__main__':\n",
        "    sys.exit(main())\n",
    );
    assert_eq!(validate_custom_workflow_code(code), Vec::<String>::new());
}

#[test]
fn partial_legacy_triple_reports_only_the_missing_pieces() {
    let code = "\ndef parse_args():\n    pass\n\ndef main():\n    pass\n";
    let rejections = validate_custom_workflow_code(code);
    assert_eq!(
        rejections,
        vec![
            "missing_required_entrypoint: run(args) or async run(args)".to_string(),
            "missing_required_entrypoint: if __name__ == '__main__' (legacy mode)".to_string(),
        ]
    );
}

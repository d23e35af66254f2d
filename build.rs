use vergen::EmitBuilder;

fn main() {
    // 生成构建信息（git 信息缺失时 vergen 只给出警告）
    EmitBuilder::builder()
        .build_timestamp()
        .git_sha(true)
        .emit()
        .expect("Failed to generate build information");
}

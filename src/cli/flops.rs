use super::Arguments;

pub(crate) fn flops(args: Arguments) -> anyhow::Result<()> {
    let report = crate::core::tflite::analyze(&args.file_path)?;

    // Display renders header, per-operator rows and the total in one go,
    // so nothing is printed for an analysis that failed mid-pass.
    print!("{}", report);

    Ok(())
}
